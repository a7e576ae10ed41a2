//! Instruction, opcode class, and operand representations.

use std::fmt;

use strum::EnumIter;

use crate::cfg::BlockId;

/// Integer width of a local or an arithmetic operation.
///
/// All arithmetic in the engine wraps modulo `2^width`, matching the target
/// runtime's unsigned integer semantics. Flattened state locals are 32-bit in
/// every observed obfuscator revision, but the model carries 64-bit for
/// completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    /// 32-bit unsigned arithmetic.
    W32,
    /// 64-bit unsigned arithmetic.
    W64,
}

impl Width {
    /// Masks `value` down to this width.
    #[must_use]
    pub fn mask(self, value: u64) -> u64 {
        match self {
            Width::W32 => value & 0xFFFF_FFFF,
            Width::W64 => value,
        }
    }

    /// Number of bits in this width.
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }
}

/// Opcode classes relevant to dispatcher recovery.
///
/// This is a deliberately closed set: the fingerprint detector and the shape
/// classifier reason about exact instruction idioms, and an open-ended opcode
/// space would make "unclassified" meaningless. Anything the source platform
/// encodes that has no dispatch-relevant semantics is normalized to [`Nop`]
/// by the collaborating block builder.
///
/// [`Nop`]: OpCode::Nop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum OpCode {
    /// Push a constant onto the evaluation stack.
    LoadConst,
    /// Push the value of a local variable slot.
    LoadLocal,
    /// Pop the top of stack into a local variable slot.
    StoreLocal,
    /// Duplicate the top of stack.
    Dup,
    /// Discard the top of stack.
    Pop,
    /// Pop two values, push their bitwise exclusive-or.
    Xor,
    /// Pop two values, push their wrapping product.
    Mul,
    /// Pop two values, push the unsigned remainder.
    RemUn,
    /// Pop two values, push their wrapping sum.
    Add,
    /// Two-way branch: pops a condition, takes the target edge when it holds.
    CondBranch,
    /// Unconditional branch to a single target.
    Branch,
    /// Multi-way branch: pops an index into the block's target table.
    Switch,
    /// Return from the method.
    Ret,
    /// Raise an exception.
    Throw,
    /// Re-raise the in-flight exception (handler regions only).
    Rethrow,
    /// Exit a protected region toward a target outside it.
    Leave,
    /// Terminate a finally/fault handler.
    EndFinally,
    /// No effect.
    Nop,
}

impl OpCode {
    /// Evaluation-stack effect of this opcode class.
    #[must_use]
    pub fn stack_behavior(self) -> StackBehavior {
        match self {
            OpCode::LoadConst | OpCode::LoadLocal => StackBehavior { pops: 0, pushes: 1 },
            OpCode::Dup => StackBehavior { pops: 1, pushes: 2 },
            OpCode::StoreLocal | OpCode::Pop | OpCode::CondBranch | OpCode::Switch => {
                StackBehavior { pops: 1, pushes: 0 }
            }
            OpCode::Xor | OpCode::Mul | OpCode::RemUn | OpCode::Add => {
                StackBehavior { pops: 2, pushes: 1 }
            }
            OpCode::Branch
            | OpCode::Ret
            | OpCode::Throw
            | OpCode::Rethrow
            | OpCode::Leave
            | OpCode::EndFinally
            | OpCode::Nop => StackBehavior { pops: 0, pushes: 0 },
        }
    }

    /// Returns `true` for opcodes that end a path instead of continuing to a
    /// successor block: return, throw, and the handler-region exits.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OpCode::Ret | OpCode::Throw | OpCode::Rethrow | OpCode::Leave | OpCode::EndFinally
        )
    }

    /// Returns `true` for opcodes that leave the current handler scope
    /// (`leave`, `endfinally`, `rethrow`).
    #[must_use]
    pub fn is_scope_exit(self) -> bool {
        matches!(self, OpCode::Leave | OpCode::EndFinally | OpCode::Rethrow)
    }
}

/// Evaluation-stack effect of one opcode class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBehavior {
    /// Number of values popped.
    pub pops: u8,
    /// Number of values pushed.
    pub pushes: u8,
}

impl StackBehavior {
    /// Net stack-depth change (`pushes - pops`).
    #[must_use]
    pub fn net(self) -> i8 {
        self.pushes as i8 - self.pops as i8
    }
}

/// Operand payload of an [`Instruction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// No operand.
    None,
    /// A constant, sign-preserved up to 64 bits.
    Const(i64),
    /// A local variable slot index.
    Local(u16),
    /// A branch target block.
    Target(BlockId),
}

/// One normalized platform instruction.
///
/// Immutable once created. Branch *edges* are canonical on the owning
/// [`Block`](crate::cfg::Block); a `Target` operand on a branch instruction
/// duplicates the edge for the benefit of the downstream serializer and always
/// agrees with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// The opcode class.
    pub opcode: OpCode,
    /// The operand payload, if any.
    pub operand: Operand,
}

impl Instruction {
    /// Creates an instruction with no operand.
    #[must_use]
    pub fn new(opcode: OpCode) -> Self {
        Instruction {
            opcode,
            operand: Operand::None,
        }
    }

    /// `load-constant` pushing `value`.
    #[must_use]
    pub fn load_const(value: i64) -> Self {
        Instruction {
            opcode: OpCode::LoadConst,
            operand: Operand::Const(value),
        }
    }

    /// `load-local` for `slot`.
    #[must_use]
    pub fn load_local(slot: u16) -> Self {
        Instruction {
            opcode: OpCode::LoadLocal,
            operand: Operand::Local(slot),
        }
    }

    /// `store-local` for `slot`.
    #[must_use]
    pub fn store_local(slot: u16) -> Self {
        Instruction {
            opcode: OpCode::StoreLocal,
            operand: Operand::Local(slot),
        }
    }

    /// Unconditional branch to `target`.
    #[must_use]
    pub fn branch(target: BlockId) -> Self {
        Instruction {
            opcode: OpCode::Branch,
            operand: Operand::Target(target),
        }
    }

    /// Conditional branch whose taken edge is `target`.
    #[must_use]
    pub fn cond_branch(target: BlockId) -> Self {
        Instruction {
            opcode: OpCode::CondBranch,
            operand: Operand::Target(target),
        }
    }

    /// Returns the constant operand, if this is a `load-constant`.
    #[must_use]
    pub fn const_value(&self) -> Option<i64> {
        match (self.opcode, self.operand) {
            (OpCode::LoadConst, Operand::Const(v)) => Some(v),
            _ => None,
        }
    }

    /// Returns the local slot, if this instruction addresses one.
    #[must_use]
    pub fn local_slot(&self) -> Option<u16> {
        match (self.opcode, self.operand) {
            (OpCode::LoadLocal | OpCode::StoreLocal, Operand::Local(s)) => Some(s),
            _ => None,
        }
    }

    /// Returns `true` if this is a `load-constant`.
    #[must_use]
    pub fn is_load_const(&self) -> bool {
        self.opcode == OpCode::LoadConst
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.opcode, self.operand) {
            (op, Operand::None) => write!(f, "{op:?}"),
            (op, Operand::Const(v)) => write!(f, "{op:?} {v}"),
            (op, Operand::Local(s)) => write!(f, "{op:?} V_{s}"),
            (op, Operand::Target(t)) => write!(f, "{op:?} {t}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_stack_behavior_net() {
        assert_eq!(OpCode::LoadConst.stack_behavior().net(), 1);
        assert_eq!(OpCode::Xor.stack_behavior().net(), -1);
        assert_eq!(OpCode::Dup.stack_behavior().net(), 1);
        assert_eq!(OpCode::Nop.stack_behavior().net(), 0);
    }

    #[test]
    fn test_every_opcode_has_stack_behavior() {
        // The match in stack_behavior is exhaustive by construction; this pins
        // the pop counts the emulator relies on for underflow checks.
        for op in OpCode::iter() {
            let behavior = op.stack_behavior();
            assert!(behavior.pops <= 2, "{op:?} pops more than two values");
        }
    }

    #[test]
    fn test_terminal_classification() {
        assert!(OpCode::Ret.is_terminal());
        assert!(OpCode::Leave.is_terminal());
        assert!(!OpCode::Branch.is_terminal());
        assert!(OpCode::Rethrow.is_scope_exit());
        assert!(!OpCode::Ret.is_scope_exit());
    }

    #[test]
    fn test_operand_accessors() {
        assert_eq!(Instruction::load_const(-7).const_value(), Some(-7));
        assert_eq!(Instruction::store_local(2).local_slot(), Some(2));
        assert_eq!(Instruction::new(OpCode::Dup).const_value(), None);
    }

    #[test]
    fn test_width_mask() {
        assert_eq!(Width::W32.mask(0x1_0000_0003), 3);
        assert_eq!(Width::W64.mask(u64::MAX), u64::MAX);
    }
}
