//! Normalized instruction model.
//!
//! This module defines the instruction abstraction every other component
//! consumes: an opcode *class* plus an optional operand, independent of any raw
//! bytecode encoding. The collaborating block builder normalizes whatever
//! encoding variants the source platform uses (short/long branch forms, inline
//! constant shortcuts) into these classes before the engine ever sees them.
//!
//! # Key Components
//!
//! - [`OpCode`] - Closed set of opcode classes relevant to dispatcher recovery
//! - [`Instruction`] - An immutable opcode/operand pair
//! - [`Operand`] - Constant, local-slot, or branch-target payload
//! - [`Width`] - Integer width governing wrap-around arithmetic
//! - [`StackBehavior`] - Net evaluation-stack effect per opcode class

mod instruction;

pub use instruction::{Instruction, OpCode, Operand, StackBehavior, Width};
