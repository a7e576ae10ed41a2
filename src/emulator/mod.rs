//! Abstract interpretation of instruction sequences.
//!
//! # Architecture
//!
//! The [`Emulator`] replays instruction runs against an abstract evaluation
//! stack and a local-variable bank. Values are either [`AbstractValue::Known`]
//! concrete integers or the absorbing [`AbstractValue::Unknown`]; the resolver
//! only ever acts on `Known` dispatch indices, so anything that touches
//! runtime-only data degrades to `Unknown` and stops that path's resolution
//! instead of guessing.
//!
//! All arithmetic wraps modulo `2^width` at the method-declared integer width,
//! including the unsigned remainder the dispatcher header uses, matching the
//! target runtime's semantics exactly.

mod value;

pub use value::AbstractValue;

use crate::{
    il::{Instruction, OpCode, Width},
    Error, Result,
};

/// Abstract interpreter over an evaluation stack and a local-variable bank.
///
/// One emulator instance serves one method resolution; the resolver restores
/// the state local before each replayed block and reads it back when
/// enqueueing successors.
#[derive(Debug, Clone)]
pub struct Emulator {
    stack: Vec<AbstractValue>,
    locals: Vec<AbstractValue>,
    width: Width,
}

impl Emulator {
    /// Creates an emulator with `local_count` locals, all `Unknown`, operating
    /// at `width`.
    #[must_use]
    pub fn new(local_count: usize, width: Width) -> Self {
        Emulator {
            stack: Vec::new(),
            locals: vec![AbstractValue::Unknown; local_count],
            width,
        }
    }

    /// Current evaluation-stack depth.
    #[must_use]
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Discards all values on the evaluation stack.
    ///
    /// Block replays are independent; the resolver clears the stack before
    /// each one so a leftover value from a prior path cannot leak into the
    /// next dispatch computation.
    pub fn clear_stack(&mut self) {
        self.stack.clear();
    }

    /// Reads a local slot; out-of-range slots read as `Unknown` (adversarial
    /// inputs may reference slots the method never declared).
    #[must_use]
    pub fn local(&self, slot: u16) -> AbstractValue {
        self.locals
            .get(usize::from(slot))
            .copied()
            .unwrap_or(AbstractValue::Unknown)
    }

    /// Overwrites a local slot; out-of-range stores are ignored.
    pub fn set_local(&mut self, slot: u16, value: AbstractValue) {
        if let Some(entry) = self.locals.get_mut(usize::from(slot)) {
            *entry = value;
        }
    }

    /// Pops the top of the evaluation stack.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StackUnderflow`] when the stack is empty.
    pub fn pop(&mut self) -> Result<AbstractValue> {
        self.stack.pop().ok_or(Error::StackUnderflow)
    }

    /// Applies each instruction's effect to the stack and local bank in order.
    ///
    /// Branch-class opcodes only consume their stack operand (a conditional
    /// branch pops its condition, a multi-way branch its index); edge
    /// transfers are the resolver's concern, not the emulator's.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StackUnderflow`] when a pop outruns the stack.
    pub fn execute(&mut self, instructions: &[Instruction]) -> Result<()> {
        for instruction in instructions {
            self.step(instruction)?;
        }
        Ok(())
    }

    fn step(&mut self, instruction: &Instruction) -> Result<()> {
        match instruction.opcode {
            OpCode::LoadConst => {
                let raw = instruction.const_value().unwrap_or_default();
                #[allow(clippy::cast_sign_loss)] // two's complement reinterpretation
                self.stack
                    .push(AbstractValue::known(raw as u64, self.width));
            }
            OpCode::LoadLocal => {
                let slot = instruction.local_slot().unwrap_or_default();
                self.stack.push(self.local(slot));
            }
            OpCode::StoreLocal => {
                let slot = instruction.local_slot().unwrap_or_default();
                let value = self.pop()?;
                self.set_local(slot, value);
            }
            OpCode::Dup => {
                let top = *self.stack.last().ok_or(Error::StackUnderflow)?;
                self.stack.push(top);
            }
            OpCode::Pop | OpCode::CondBranch | OpCode::Switch => {
                self.pop()?;
            }
            OpCode::Xor | OpCode::Mul | OpCode::RemUn | OpCode::Add => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.stack.push(lhs.binary(instruction.opcode, rhs));
            }
            OpCode::Branch
            | OpCode::Ret
            | OpCode::Throw
            | OpCode::Rethrow
            | OpCode::Leave
            | OpCode::EndFinally
            | OpCode::Nop => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;
    use crate::il::Operand;

    fn known(v: u64) -> AbstractValue {
        AbstractValue::known(v, Width::W32)
    }

    #[test]
    fn test_load_store_roundtrip() {
        let mut emu = Emulator::new(2, Width::W32);
        emu.execute(&[Instruction::load_const(42), Instruction::store_local(1)])
            .unwrap();
        assert_eq!(emu.local(1), known(42));
        assert_eq!(emu.local(0), AbstractValue::Unknown);
    }

    #[test]
    fn test_negative_constants_wrap_to_width() {
        let mut emu = Emulator::new(0, Width::W32);
        emu.execute(&[Instruction::load_const(-1)]).unwrap();
        assert_eq!(emu.pop().unwrap(), known(0xFFFF_FFFF));
    }

    #[test]
    fn test_confuserex_state_update_sequence() {
        // state' = (state * mul_key) ^ xor_key at 32-bit wrap.
        let mut emu = Emulator::new(1, Width::W32);
        emu.set_local(0, known(0xD189_3F0C));
        emu.execute(&[
            Instruction::load_local(0),
            Instruction::load_const(1_975_223_132),
            Instruction::new(OpCode::Mul),
            Instruction::load_const(483_589_312),
            Instruction::new(OpCode::Xor),
        ])
        .unwrap();
        let expected = 0xD189_3F0Cu32
            .wrapping_mul(1_975_223_132)
            ^ 483_589_312u32;
        assert_eq!(emu.pop().unwrap(), known(u64::from(expected)));
    }

    #[test]
    fn test_unknown_is_absorbing() {
        let mut emu = Emulator::new(1, Width::W32);
        emu.execute(&[
            Instruction::load_local(0), // Unknown
            Instruction::load_const(7),
            Instruction::new(OpCode::Xor),
        ])
        .unwrap();
        assert_eq!(emu.pop().unwrap(), AbstractValue::Unknown);
    }

    #[test]
    fn test_rem_un_is_unsigned() {
        let mut emu = Emulator::new(0, Width::W32);
        // -5 reinterpreted as 0xFFFF_FFFB, then % 7 unsigned.
        emu.execute(&[
            Instruction::load_const(-5),
            Instruction::load_const(7),
            Instruction::new(OpCode::RemUn),
        ])
        .unwrap();
        assert_eq!(emu.pop().unwrap(), known(0xFFFF_FFFBu64 % 7));
    }

    #[test]
    fn test_underflow_is_reported() {
        let mut emu = Emulator::new(0, Width::W32);
        let err = emu.execute(&[Instruction::new(OpCode::Pop)]).unwrap_err();
        assert!(matches!(err, Error::StackUnderflow));
    }

    #[test]
    fn test_every_opcode_matches_declared_stack_behavior() {
        for op in OpCode::iter() {
            let mut emu = Emulator::new(4, Width::W32);
            // Preload enough operands for any opcode class.
            emu.stack = vec![known(8), known(3)];
            let instruction = Instruction {
                opcode: op,
                operand: match op {
                    OpCode::LoadConst => Operand::Const(1),
                    OpCode::LoadLocal | OpCode::StoreLocal => Operand::Local(0),
                    _ => Operand::None,
                },
            };
            emu.step(&instruction).unwrap();
            let expected = 2 + i64::from(op.stack_behavior().net());
            assert_eq!(
                emu.stack_len() as i64,
                expected,
                "{op:?} diverges from its declared stack behavior"
            );
        }
    }
}
