// Copyright 2026 The deflatten authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! # deflatten
//!
//! A control-flow deflattening engine for switch-dispatcher obfuscated CIL methods.
//!
//! Control-flow flattening rewrites a method's branching structure into a state
//! machine: a single multi-way branch (the "dispatcher"), driven by an obfuscated
//! integer state local, replaces every original control edge. This crate recognizes
//! the dispatcher fingerprint, symbolically evaluates the scattered state-update
//! expressions, and rewires each block directly to its true successor, removing
//! the dispatcher entirely.
//!
//! ## Scope
//!
//! `deflatten` operates purely on an in-memory block graph. Parsing bytecode into
//! blocks, decrypting method bodies, and serializing the repaired graph back to an
//! instruction stream are collaborator concerns and live outside this crate. The
//! engine never touches files, metadata heaps, or PE structures.
//!
//! ## Architecture
//!
//! - [`il`] - Normalized instruction model (opcode classes, constant operands,
//!   branch targets) independent of any raw encoding
//! - [`cfg`] - Basic blocks in an index-addressed arena, exception-handler scope
//!   tree, edge rewiring primitives, and a programmatic [`cfg::MethodBuilder`]
//! - [`emulator`] - Abstract interpreter over an evaluation stack and local bank,
//!   producing [`emulator::AbstractValue::Known`] integers or an absorbing
//!   `Unknown` marker
//! - [`deflatten`] - The recovery pipeline: fingerprint detection, branch target
//!   tracing, and the worklist rewriter
//! - [`engine`] - Per-method and parallel whole-module entry points with
//!   structured event reporting
//!
//! ## Quick Start
//!
//! ```rust
//! use deflatten::cfg::MethodBuilder;
//!
//! let mut builder = MethodBuilder::new();
//! builder.local_32();
//! builder.block("entry").load_const(3).fall_through("dispatcher");
//! builder
//!     .block("dispatcher")
//!     .dup()
//!     .store_local(0)
//!     .load_const(4)
//!     .rem_un()
//!     .switch(&["a", "b", "c", "d"])
//!     .fall_through("exit");
//! builder.block("a").ret();
//! builder.block("b").ret();
//! builder.block("c").ret();
//! builder.block("d").ret();
//! builder.block("exit").ret();
//! let mut body = builder.finish()?;
//!
//! // Entry pushes 3, so the entry block is rewired directly to case `d`.
//! let changed = deflatten::try_deobfuscate(&mut body);
//! assert!(changed);
//! # Ok::<(), deflatten::Error>(())
//! ```
//!
//! ## Safety Model
//!
//! The engine fails closed: resolution runs against a private clone of the method
//! body and replaces the caller's graph only when every reachable block shape was
//! classified and every dispatch index reduced to a concrete integer. A method
//! that deviates from the known obfuscator idioms is reported and left untouched,
//! never partially rewritten.

#[macro_use]
mod macros;

mod error;

pub mod cfg;
pub mod config;
pub mod context;
pub mod deflatten;
pub mod emulator;
pub mod engine;
pub mod events;
pub mod il;
pub mod pass;
pub mod prelude;
pub mod utils;

pub use crate::{
    config::EngineConfig,
    engine::{try_deobfuscate, Engine, EngineReport},
    error::Error,
};

/// Crate-wide result type with [`Error`] as the failure case.
pub type Result<T> = std::result::Result<T, Error>;
