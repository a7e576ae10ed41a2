//! Abstract values: concrete integers or the absorbing unknown.

use crate::il::{OpCode, Width};

/// Result of abstractly evaluating an expression.
///
/// `Known` carries a concrete integer already masked to its width. Any
/// operation with an `Unknown` operand - or between operands of different
/// widths - yields `Unknown`; the resolver treats that as "this path cannot
/// be resolved", never as a value to guess at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractValue {
    /// A concrete integer of the given width.
    Known(u64, Width),
    /// Value depends on runtime-only data.
    Unknown,
}

impl AbstractValue {
    /// Creates a `Known` value masked to `width`.
    #[must_use]
    pub fn known(value: u64, width: Width) -> Self {
        AbstractValue::Known(width.mask(value), width)
    }

    /// Returns the concrete integer, if known.
    #[must_use]
    pub fn as_known(self) -> Option<u64> {
        match self {
            AbstractValue::Known(v, _) => Some(v),
            AbstractValue::Unknown => None,
        }
    }

    /// Returns `true` for `Known`.
    #[must_use]
    pub fn is_known(self) -> bool {
        matches!(self, AbstractValue::Known(..))
    }

    /// Combines two values under a binary opcode, wrapping at the common
    /// width.
    ///
    /// Division-like corner cases degrade to `Unknown` rather than faulting:
    /// an unsigned remainder by zero would trap at runtime, and adversarial
    /// inputs do reach this path.
    #[must_use]
    pub fn binary(self, op: OpCode, rhs: AbstractValue) -> AbstractValue {
        let (AbstractValue::Known(a, wa), AbstractValue::Known(b, wb)) = (self, rhs) else {
            return AbstractValue::Unknown;
        };
        if wa != wb {
            return AbstractValue::Unknown;
        }
        let result = match op {
            OpCode::Xor => a ^ b,
            OpCode::Add => a.wrapping_add(b),
            OpCode::Mul => a.wrapping_mul(b),
            OpCode::RemUn => {
                if b == 0 {
                    return AbstractValue::Unknown;
                }
                a % b
            }
            _ => return AbstractValue::Unknown,
        };
        AbstractValue::known(result, wa)
    }
}
