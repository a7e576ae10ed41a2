//! Dispatcher fingerprint detection.
//!
//! The flattening scheme leaves a fixed instruction idiom directly in front of
//! its multi-way branch: `duplicate, store-to-state-local, load-constant,
//! remainder-unsigned`. Some obfuscator revisions additionally run the raw
//! state through an affine predicate (`xor` with a constant, optionally after
//! a constant `multiply`) before that idiom; the predicate belongs to the
//! header and is captured with it.
//!
//! Detection is the primary false-positive guard: every check prefers "no
//! match" over an incorrect match, because a match authorizes the resolver to
//! rewrite the method.

use crate::{
    cfg::{BlockId, MethodBody, Scope},
    emulator::Emulator,
    il::{Instruction, OpCode, Width},
    Error, Result,
};

/// Predicate transform applied to the raw state before the modulo step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// The raw value feeds the modulo directly.
    None,
    /// The raw value is masked with `xor` (optionally combined with a
    /// constant multiply) first.
    XorAffine,
}

/// A recognized dispatcher: the block, the header that turns a raw pushed
/// value into a case index, and the case table.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherDescriptor {
    /// The block ending in the multi-way branch.
    pub block: BlockId,
    /// Local slot holding the dispatch state between iterations.
    pub state_local: u16,
    /// Integer width of the state local.
    pub width: Width,
    /// The header instructions in order, terminal multi-way branch excluded.
    pub header: Vec<Instruction>,
    /// Which predicate transform the header begins with.
    pub predicate: Predicate,
    /// Branch targets indexed by case number.
    pub cases: Vec<BlockId>,
}

impl DispatcherDescriptor {
    /// Replays the header against the emulator's current state and returns
    /// the concrete dispatch index.
    ///
    /// The caller arranges for the raw state value to sit on the abstract
    /// stack first (by replaying the predecessor's final instructions).
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnresolvedValue`] when the index does not reduce to a
    /// concrete integer, or [`Error::StackUnderflow`] on malformed replays.
    pub fn emulate_header(&self, emulator: &mut Emulator) -> Result<u64> {
        emulator.execute(&self.header)?;
        emulator.pop()?.as_known().ok_or(Error::UnresolvedValue)
    }

    /// Looks up the case block for a resolved index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CaseIndexOutOfRange`] when `index` exceeds the table;
    /// indices are attacker-controlled and never trusted.
    pub fn case(&self, index: u64) -> Result<BlockId> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.cases.get(i).copied())
            .ok_or(Error::CaseIndexOutOfRange {
                index,
                table_len: self.cases.len(),
            })
    }
}

/// Scans one scope for the dispatcher fingerprint.
///
/// Preconditions for a positive match, all mandatory:
///
/// 1. the method declares a 32-bit local for the `store-local` slot in the
///    header,
/// 2. a block in this scope ends in a multi-way branch with at least
///    `min_cases` targets,
/// 3. the four instructions immediately before it are, in exact order,
///    `duplicate, store-local, load-constant, remainder-unsigned`,
/// 4. the modulo constant is positive and at least the case table length
///    (indices beyond the table fall to the default edge).
///
/// Anything else returns `None` and the caller leaves the method untouched.
#[must_use]
pub fn detect(body: &MethodBody, scope: &Scope, min_cases: usize) -> Option<DispatcherDescriptor> {
    scope
        .blocks
        .iter()
        .find_map(|&id| match_dispatcher(body, id, min_cases))
}

fn match_dispatcher(
    body: &MethodBody,
    id: BlockId,
    min_cases: usize,
) -> Option<DispatcherDescriptor> {
    let block = body.block(id);
    if !block.is_multiway_branch() || block.targets.len() < min_cases {
        return None;
    }

    let instrs = &block.instructions;
    // switch at n-1; rem.un, ldc, stloc, dup walking back from it.
    let n = instrs.len();
    if n < 5 {
        return None;
    }
    if instrs[n - 2].opcode != OpCode::RemUn {
        return None;
    }
    let modulus = instrs[n - 3].const_value()?;
    let state_local = match instrs[n - 4] {
        i if i.opcode == OpCode::StoreLocal => i.local_slot()?,
        _ => return None,
    };
    if instrs[n - 5].opcode != OpCode::Dup {
        return None;
    }

    // The case table cannot exceed the modulo range; indices past the table
    // fall to the default edge, but a table with unreachable entries means
    // this switch is something else.
    let modulus = u64::try_from(modulus).ok()?;
    if modulus == 0 || block.targets.len() as u64 > modulus {
        return None;
    }

    // The state local must exist at the dispatch width.
    let width = *body.locals.get(usize::from(state_local))?;
    if width != Width::W32 {
        return None;
    }

    // Optional xor-affine predicate further back: `ldc, xor` directly before
    // the dup, possibly preceded by `ldc, mul`.
    let mut start = n - 5;
    let mut predicate = Predicate::None;
    if start >= 2
        && instrs[start - 1].opcode == OpCode::Xor
        && instrs[start - 2].is_load_const()
    {
        start -= 2;
        predicate = Predicate::XorAffine;
        if start >= 2
            && instrs[start - 1].opcode == OpCode::Mul
            && instrs[start - 2].is_load_const()
        {
            start -= 2;
        }
    }

    Some(DispatcherDescriptor {
        block: id,
        state_local,
        width,
        header: instrs[start..n - 1].to_vec(),
        predicate,
        cases: block.targets.clone(),
    })
}
