//! Basic blocks, the method-body arena, and exception-handler scopes.
//!
//! # Architecture
//!
//! Blocks reference each other cyclically (predecessor and successor lists), so
//! they live in an arena - a plain vector owned by [`MethodBody`] - and every
//! edge is a stable [`BlockId`] index into it. Rewiring an edge replaces index
//! entries; no reference counting, no ownership cycles. Block identity is the
//! index, never the contents: the resolver mutates blocks in place as it
//! retires dispatcher edges.
//!
//! # Key Components
//!
//! - [`BlockId`] / [`Block`] - One basic block and its arena handle
//! - [`MethodBody`] - The arena plus entry point, locals, and handler layout
//! - [`Scope`] - Tree of block groupings mirroring exception-handler nesting
//! - [`MethodBuilder`] - Programmatic construction with label fixup
//! - [`to_dot`] - Graphviz rendering for diagnostics
//!
//! # Edge Model
//!
//! A block has at most one *fallthrough* successor (reached without an explicit
//! branch, or through an unconditional branch instruction) and zero or more
//! *target* successors (the taken edge of a conditional branch, or a multi-way
//! branch's case table in case order). Predecessor lists carry one entry per
//! incoming edge and are maintained symmetrically by the mutation operations on
//! [`MethodBody`] - callers never touch them directly.

mod builder;
mod dot;
mod scope;

use std::fmt;

use bitflags::bitflags;

pub use builder::MethodBuilder;
pub use dot::to_dot;
pub use scope::{LayoutNode, RegionKind, Scope, ScopeId};

use crate::il::{Instruction, OpCode, Width};

/// Stable arena index identifying one [`Block`] within a [`MethodBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    /// Creates a block id from an arena index.
    #[must_use]
    pub fn new(index: usize) -> Self {
        BlockId(u32::try_from(index).expect("block arena exceeds u32 indices"))
    }

    /// The arena index this id addresses.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Opaque identifier tying a [`MethodBody`] to the shared analysis context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodToken(u32);

impl MethodToken {
    /// Creates a token from its raw value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        MethodToken(value)
    }

    /// The raw token value.
    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MethodToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

bitflags! {
    /// Markers the engine leaves on blocks for downstream consumers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u8 {
        /// The resolver rewrote this block's terminal instructions.
        const TAMPERED = 0x01;
        /// This block was a dispatcher before resolution.
        const DISPATCHER = 0x02;
        /// No live inbound edge remains; eligible for external dead-code
        /// elimination.
        const DEAD = 0x04;
    }
}

/// One basic block: an ordered instruction run plus its explicit edges.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    /// The instructions of this block, in execution order.
    pub instructions: Vec<Instruction>,
    /// One entry per inbound edge, maintained by [`MethodBody`] mutations.
    pub predecessors: Vec<BlockId>,
    /// Explicit branch targets: the taken edge of a conditional branch, or a
    /// multi-way branch's case table in case order.
    pub targets: Vec<BlockId>,
    /// The successor reached without an explicit branch (or through a trailing
    /// unconditional branch instruction).
    pub fallthrough: Option<BlockId>,
    /// The scope this block belongs to; assigned by [`Scope::build`].
    pub scope: ScopeId,
    /// Engine markers for downstream consumers.
    pub flags: BlockFlags,
}

impl Block {
    /// Creates an empty block.
    #[must_use]
    pub fn new() -> Self {
        Block::default()
    }

    /// The last instruction, if any.
    #[must_use]
    pub fn last(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Returns `true` if the block ends in a conditional branch.
    #[must_use]
    pub fn is_conditional_branch(&self) -> bool {
        self.last().is_some_and(|i| i.opcode == OpCode::CondBranch)
    }

    /// Returns `true` if the block ends in a multi-way branch.
    #[must_use]
    pub fn is_multiway_branch(&self) -> bool {
        self.last().is_some_and(|i| i.opcode == OpCode::Switch)
    }

    /// Returns `true` if the block ends in `opcode`.
    #[must_use]
    pub fn ends_in(&self, opcode: OpCode) -> bool {
        self.last().is_some_and(|i| i.opcode == opcode)
    }

    /// Number of trailing instructions that merely restate the fallthrough
    /// edge (a single unconditional branch, or none).
    #[must_use]
    pub fn trailing_branch_len(&self) -> usize {
        usize::from(self.ends_in(OpCode::Branch))
    }

    /// The instruction run with any trailing unconditional branch stripped;
    /// shape classification works on this view so that explicit-branch and
    /// plain-fallthrough encodings of the same block match identically.
    #[must_use]
    pub fn body_tail(&self) -> &[Instruction] {
        &self.instructions[..self.instructions.len() - self.trailing_branch_len()]
    }

    /// Total number of outgoing edges (targets plus fallthrough).
    #[must_use]
    pub fn out_degree(&self) -> usize {
        self.targets.len() + usize::from(self.fallthrough.is_some())
    }

    /// The unique successor, if the block has exactly one outgoing edge.
    #[must_use]
    pub fn only_target(&self) -> Option<BlockId> {
        match (self.fallthrough, self.targets.as_slice()) {
            (Some(ft), []) => Some(ft),
            (None, [t]) => Some(*t),
            _ => None,
        }
    }

    /// The unique predecessor, if the block has exactly one inbound edge.
    #[must_use]
    pub fn only_predecessor(&self) -> Option<BlockId> {
        match self.predecessors.as_slice() {
            [p] => Some(*p),
            _ => None,
        }
    }

    /// Returns `true` if every inbound edge originates from `block`.
    #[must_use]
    pub fn has_only_source(&self, block: BlockId) -> bool {
        !self.predecessors.is_empty() && self.predecessors.iter().all(|&p| p == block)
    }

    /// Returns `true` if the block contains only no-effect instructions.
    #[must_use]
    pub fn is_nop_block(&self) -> bool {
        self.instructions.iter().all(|i| i.opcode == OpCode::Nop)
    }

    /// Returns `true` if the block continues only via its fallthrough edge.
    #[must_use]
    pub fn is_fallthrough_only(&self) -> bool {
        self.fallthrough.is_some() && self.targets.is_empty()
    }
}

/// The per-method block arena handed to the engine by the collaborating block
/// builder, and mutated in place by a successful resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
    /// Token identifying this method to the analysis context.
    pub token: MethodToken,
    /// The block arena; [`BlockId`] values index into it.
    pub blocks: Vec<Block>,
    /// The method's entry block.
    pub entry: BlockId,
    /// Declared local variable widths, indexed by slot.
    pub locals: Vec<Width>,
    /// Exception-handler region layout; empty when the method declares no
    /// protected regions, in which case every block belongs to the root scope.
    pub layout: Vec<LayoutNode>,
}

impl MethodBody {
    /// Shared access to a block.
    #[must_use]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    /// Mutable access to a block.
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    /// Number of blocks in the arena.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Iterates all block ids in arena order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len()).map(BlockId::new)
    }

    /// Records one inbound edge `from -> to`.
    fn link(&mut self, from: BlockId, to: BlockId) {
        self.block_mut(to).predecessors.push(from);
    }

    /// Removes one inbound edge `from -> to`.
    fn unlink(&mut self, from: BlockId, to: BlockId) {
        let preds = &mut self.block_mut(to).predecessors;
        if let Some(pos) = preds.iter().position(|&p| p == from) {
            preds.swap_remove(pos);
        }
    }

    /// Replaces the fallthrough edge of `block`, keeping predecessor lists
    /// symmetric. A trailing unconditional branch instruction is re-aimed so
    /// its operand stays in agreement with the edge.
    pub fn set_fallthrough(&mut self, block: BlockId, target: Option<BlockId>) {
        if let Some(old) = self.block(block).fallthrough {
            self.unlink(block, old);
        }
        let b = self.block_mut(block);
        b.fallthrough = target;
        if let Some(new) = target {
            if b.ends_in(OpCode::Branch) {
                if let Some(last) = b.instructions.last_mut() {
                    *last = Instruction::branch(new);
                }
            }
            self.link(block, new);
        }
    }

    /// Retires every outgoing edge of `block`.
    pub fn retire_outgoing(&mut self, block: BlockId) {
        if let Some(ft) = self.block(block).fallthrough {
            self.unlink(block, ft);
        }
        for t in self.block(block).targets.clone() {
            self.unlink(block, t);
        }
        let b = self.block_mut(block);
        b.fallthrough = None;
        b.targets.clear();
    }

    /// Drops the last `strip` instructions of `block` and replaces its entire
    /// outgoing edge set with a direct unconditional branch to `target`.
    ///
    /// This is the resolver's fundamental rewrite: the stripped instructions
    /// are the replayed state computation, and the new edge is the true
    /// successor recovered from the dispatcher's case table.
    pub fn replace_last_with_branch(&mut self, block: BlockId, strip: usize, target: BlockId) {
        self.retire_outgoing(block);
        let b = self.block_mut(block);
        let keep = b.instructions.len().saturating_sub(strip);
        b.instructions.truncate(keep);
        b.instructions.push(Instruction::branch(target));
        b.fallthrough = Some(target);
        b.flags |= BlockFlags::TAMPERED;
        self.link(block, target);
    }

    /// Empties `block`, retires its outgoing edges, and marks it dead.
    pub fn elide_block(&mut self, block: BlockId) {
        self.retire_outgoing(block);
        let b = self.block_mut(block);
        b.instructions.clear();
        b.flags |= BlockFlags::DEAD | BlockFlags::TAMPERED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_block_body() -> MethodBody {
        let mut builder = MethodBuilder::new();
        builder.block("a").nop().fall_through("b");
        builder.block("b").ret();
        builder.finish().unwrap()
    }

    #[test]
    fn test_edges_are_symmetric() {
        let body = two_block_body();
        let a = BlockId::new(0);
        let b = BlockId::new(1);
        assert_eq!(body.block(a).fallthrough, Some(b));
        assert_eq!(body.block(b).predecessors, vec![a]);
    }

    #[test]
    fn test_set_fallthrough_moves_pred_entry() {
        let mut builder = MethodBuilder::new();
        builder.block("a").nop().fall_through("b");
        builder.block("b").nop().fall_through("c");
        builder.block("c").ret();
        let mut body = builder.finish().unwrap();

        let (a, b, c) = (BlockId::new(0), BlockId::new(1), BlockId::new(2));
        body.set_fallthrough(a, Some(c));
        assert!(body.block(b).predecessors.is_empty());
        assert!(body.block(c).predecessors.contains(&a));
        assert!(body.block(c).predecessors.contains(&b));
    }

    #[test]
    fn test_replace_last_with_branch_strips_and_rewires() {
        let mut builder = MethodBuilder::new();
        builder
            .block("a")
            .load_local(0)
            .load_const(3)
            .mul()
            .fall_through("b");
        builder.block("b").ret();
        builder.block("c").ret();
        let mut body = builder.finish().unwrap();

        let (a, b, c) = (BlockId::new(0), BlockId::new(1), BlockId::new(2));
        body.replace_last_with_branch(a, 3, c);

        let block = body.block(a);
        assert_eq!(block.instructions.len(), 1);
        assert_eq!(block.instructions[0], Instruction::branch(c));
        assert_eq!(block.fallthrough, Some(c));
        assert!(block.flags.contains(BlockFlags::TAMPERED));
        assert!(body.block(b).predecessors.is_empty());
        assert_eq!(body.block(c).predecessors, vec![a]);
    }

    #[test]
    fn test_only_target_counts_both_edge_kinds() {
        let mut block = Block::new();
        assert_eq!(block.only_target(), None);
        block.fallthrough = Some(BlockId::new(1));
        assert_eq!(block.only_target(), Some(BlockId::new(1)));
        block.targets.push(BlockId::new(2));
        assert_eq!(block.only_target(), None);
    }
}
