//! Convenient glob-import surface for the most common types.
//!
//! # Example
//!
//! ```rust
//! use deflatten::prelude::*;
//!
//! let mut builder = MethodBuilder::new();
//! builder.block("entry").ret();
//! let mut body = builder.finish()?;
//! assert!(!try_deobfuscate(&mut body));
//! # Ok::<(), deflatten::Error>(())
//! ```

pub use crate::{
    cfg::{Block, BlockFlags, BlockId, MethodBody, MethodBuilder, MethodToken, RegionKind, Scope},
    config::EngineConfig,
    context::AnalysisContext,
    deflatten::{detect, unflatten_method, DispatcherDescriptor, Predicate},
    emulator::{AbstractValue, Emulator},
    engine::{try_deobfuscate, Engine, EngineReport},
    events::{Event, EventKind, EventLog},
    il::{Instruction, OpCode, Width},
    pass::{DeflattenPass, MethodPass},
    Error, Result,
};
