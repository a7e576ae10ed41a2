//! Programmatic method-body construction with label fixup.
//!
//! The engine itself never parses bytecode; collaborators hand it finished
//! block graphs. [`MethodBuilder`] is the programmatic way to produce such a
//! graph - tests assemble fixture methods with it, and a bytecode frontend can
//! target it instead of wiring [`Block`](crate::cfg::Block) edges by hand.
//! Blocks are declared in source order under string labels; every edge and
//! branch operand names a label, and [`MethodBuilder::finish`] resolves them
//! to [`BlockId`]s and computes predecessor lists.

use std::collections::HashMap;

use crate::{
    cfg::{Block, BlockId, LayoutNode, MethodBody, MethodToken, RegionKind},
    il::{Instruction, OpCode, Operand, Width},
    Result,
};

/// An instruction whose branch operand may still be an unresolved label.
#[derive(Debug, Clone)]
enum PendingOperand {
    None,
    Const(i64),
    Local(u16),
    Label(String),
}

#[derive(Debug, Clone)]
struct PendingInstr {
    opcode: OpCode,
    operand: PendingOperand,
}

#[derive(Debug, Clone, Default)]
struct PendingBlock {
    instructions: Vec<PendingInstr>,
    fallthrough: Option<String>,
    targets: Vec<String>,
}

/// Builds a [`MethodBody`] from labeled blocks.
///
/// The first declared block becomes the method entry. Handler regions are
/// declared by bracketing block declarations between [`begin_region`] and
/// [`end_region`]; methods without regions get an empty layout (single root
/// scope).
///
/// # Example
///
/// ```rust
/// use deflatten::cfg::MethodBuilder;
///
/// let mut builder = MethodBuilder::new();
/// builder.block("entry").load_const(1).fall_through("exit");
/// builder.block("exit").ret();
/// let body = builder.finish()?;
/// assert_eq!(body.block_count(), 2);
/// # Ok::<(), deflatten::Error>(())
/// ```
///
/// [`begin_region`]: MethodBuilder::begin_region
/// [`end_region`]: MethodBuilder::end_region
#[derive(Debug, Default)]
pub struct MethodBuilder {
    token: u32,
    locals: Vec<Width>,
    labels: Vec<String>,
    blocks: Vec<PendingBlock>,
    index: HashMap<String, usize>,
    /// Stack of layout levels; the bottom entry is the method root.
    layout_stack: Vec<(RegionKind, Vec<LayoutNode>)>,
    defect: Option<String>,
}

impl MethodBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        MethodBuilder {
            layout_stack: vec![(RegionKind::Root, Vec::new())],
            ..MethodBuilder::default()
        }
    }

    /// Sets the method token reported to the analysis context.
    pub fn token(&mut self, token: u32) -> &mut Self {
        self.token = token;
        self
    }

    /// Declares a local variable slot of the given width.
    pub fn local(&mut self, width: Width) -> &mut Self {
        self.locals.push(width);
        self
    }

    /// Declares a 32-bit local variable slot.
    pub fn local_32(&mut self) -> &mut Self {
        self.local(Width::W32)
    }

    /// Starts a new block under `label` and makes it current.
    pub fn block(&mut self, label: &str) -> &mut Self {
        if self.index.contains_key(label) {
            self.fail(format!("duplicate block label '{label}'"));
            return self;
        }
        let idx = self.blocks.len();
        self.index.insert(label.to_string(), idx);
        self.labels.push(label.to_string());
        self.blocks.push(PendingBlock::default());
        self.layout_top().push(LayoutNode::Block(BlockId::new(idx)));
        self
    }

    /// The id a declared block will have in the finished body.
    #[must_use]
    pub fn block_id(&self, label: &str) -> Option<BlockId> {
        self.index.get(label).map(|&i| BlockId::new(i))
    }

    /// Opens a nested handler region; blocks declared until the matching
    /// [`end_region`](MethodBuilder::end_region) belong to it.
    pub fn begin_region(&mut self, kind: RegionKind) -> &mut Self {
        self.layout_stack.push((kind, Vec::new()));
        self
    }

    /// Closes the innermost open handler region.
    pub fn end_region(&mut self) -> &mut Self {
        if self.layout_stack.len() < 2 {
            self.fail("end_region without begin_region".to_string());
            return self;
        }
        let (kind, nodes) = self.layout_stack.pop().expect("checked depth");
        self.layout_top().push(LayoutNode::Region(kind, nodes));
        self
    }

    /// Appends `load-constant value`.
    pub fn load_const(&mut self, value: i64) -> &mut Self {
        self.push(OpCode::LoadConst, PendingOperand::Const(value))
    }

    /// Appends `load-local slot`.
    pub fn load_local(&mut self, slot: u16) -> &mut Self {
        self.push(OpCode::LoadLocal, PendingOperand::Local(slot))
    }

    /// Appends `store-local slot`.
    pub fn store_local(&mut self, slot: u16) -> &mut Self {
        self.push(OpCode::StoreLocal, PendingOperand::Local(slot))
    }

    /// Appends `duplicate`.
    pub fn dup(&mut self) -> &mut Self {
        self.push(OpCode::Dup, PendingOperand::None)
    }

    /// Appends `pop`.
    pub fn pop(&mut self) -> &mut Self {
        self.push(OpCode::Pop, PendingOperand::None)
    }

    /// Appends `xor`.
    pub fn xor(&mut self) -> &mut Self {
        self.push(OpCode::Xor, PendingOperand::None)
    }

    /// Appends `multiply`.
    pub fn mul(&mut self) -> &mut Self {
        self.push(OpCode::Mul, PendingOperand::None)
    }

    /// Appends `remainder-unsigned`.
    pub fn rem_un(&mut self) -> &mut Self {
        self.push(OpCode::RemUn, PendingOperand::None)
    }

    /// Appends `add`.
    pub fn add(&mut self) -> &mut Self {
        self.push(OpCode::Add, PendingOperand::None)
    }

    /// Appends `nop`.
    pub fn nop(&mut self) -> &mut Self {
        self.push(OpCode::Nop, PendingOperand::None)
    }

    /// Appends `return`; the block gets no outgoing edges.
    pub fn ret(&mut self) -> &mut Self {
        self.push(OpCode::Ret, PendingOperand::None)
    }

    /// Appends `throw`; the block gets no outgoing edges.
    pub fn throw(&mut self) -> &mut Self {
        self.push(OpCode::Throw, PendingOperand::None)
    }

    /// Appends `rethrow`; the block gets no outgoing edges.
    pub fn rethrow(&mut self) -> &mut Self {
        self.push(OpCode::Rethrow, PendingOperand::None)
    }

    /// Appends `leave`; handler exit edges are implicit.
    pub fn leave(&mut self) -> &mut Self {
        self.push(OpCode::Leave, PendingOperand::None)
    }

    /// Appends `end-finally`.
    pub fn end_finally(&mut self) -> &mut Self {
        self.push(OpCode::EndFinally, PendingOperand::None)
    }

    /// Appends an unconditional branch to `label` and sets it as the block's
    /// continuation edge.
    pub fn br(&mut self, label: &str) -> &mut Self {
        self.push(OpCode::Branch, PendingOperand::Label(label.to_string()));
        self.set_fallthrough_label(label)
    }

    /// Appends a conditional branch whose taken edge is `label`. The untaken
    /// continuation must be declared with
    /// [`fall_through`](MethodBuilder::fall_through).
    pub fn cond_br(&mut self, label: &str) -> &mut Self {
        self.push(OpCode::CondBranch, PendingOperand::Label(label.to_string()));
        if let Some(block) = self.current_mut() {
            block.targets.push(label.to_string());
        }
        self
    }

    /// Appends a multi-way branch over `labels` in case order.
    pub fn switch(&mut self, labels: &[&str]) -> &mut Self {
        self.push(OpCode::Switch, PendingOperand::None);
        if let Some(block) = self.current_mut() {
            block.targets.extend(labels.iter().map(|l| (*l).to_string()));
        }
        self
    }

    /// Declares the block's fallthrough successor without emitting an
    /// instruction.
    pub fn fall_through(&mut self, label: &str) -> &mut Self {
        self.set_fallthrough_label(label)
    }

    /// Resolves all labels and produces the finished [`MethodBody`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedLayout`](crate::Error::MalformedLayout) when
    /// no block was declared, a label is unknown or duplicated, a region was
    /// left open, or an instruction was appended before the first block.
    pub fn finish(&self) -> Result<MethodBody> {
        if let Some(defect) = &self.defect {
            return Err(malformed_error!("{}", defect));
        }
        if self.blocks.is_empty() {
            return Err(malformed_error!("method has no blocks"));
        }
        if self.layout_stack.len() != 1 {
            return Err(malformed_error!(
                "{} unclosed region(s)",
                self.layout_stack.len() - 1
            ));
        }

        let mut body = MethodBody {
            token: MethodToken::new(self.token),
            blocks: Vec::with_capacity(self.blocks.len()),
            entry: BlockId::new(0),
            locals: self.locals.clone(),
            layout: Vec::new(),
        };

        for pending in &self.blocks {
            let mut block = Block::new();
            for instr in &pending.instructions {
                let operand = match &instr.operand {
                    PendingOperand::None => Operand::None,
                    PendingOperand::Const(v) => Operand::Const(*v),
                    PendingOperand::Local(s) => Operand::Local(*s),
                    PendingOperand::Label(l) => Operand::Target(self.resolve(l)?),
                };
                block.instructions.push(Instruction {
                    opcode: instr.opcode,
                    operand,
                });
            }
            block.fallthrough = pending
                .fallthrough
                .as_deref()
                .map(|l| self.resolve(l))
                .transpose()?;
            block.targets = pending
                .targets
                .iter()
                .map(|l| self.resolve(l))
                .collect::<Result<_>>()?;
            body.blocks.push(block);
        }

        // Edges are complete; derive predecessor lists.
        for id in 0..body.blocks.len() {
            let from = BlockId::new(id);
            let edges: Vec<BlockId> = body
                .block(from)
                .fallthrough
                .into_iter()
                .chain(body.block(from).targets.iter().copied())
                .collect();
            for to in edges {
                body.block_mut(to).predecessors.push(from);
            }
        }

        // A single root level means no handler regions: leave the layout
        // empty so every block lands in the root scope.
        let (_, root_nodes) = &self.layout_stack[0];
        if root_nodes
            .iter()
            .any(|n| matches!(n, LayoutNode::Region(..)))
        {
            body.layout = root_nodes.clone();
        }

        Ok(body)
    }

    fn layout_top(&mut self) -> &mut Vec<LayoutNode> {
        &mut self
            .layout_stack
            .last_mut()
            .expect("layout stack never empties")
            .1
    }

    fn current_mut(&mut self) -> Option<&mut PendingBlock> {
        if self.blocks.is_empty() {
            self.fail("instruction appended before the first block".to_string());
            return None;
        }
        self.blocks.last_mut()
    }

    fn push(&mut self, opcode: OpCode, operand: PendingOperand) -> &mut Self {
        if let Some(block) = self.current_mut() {
            block.instructions.push(PendingInstr { opcode, operand });
        }
        self
    }

    fn set_fallthrough_label(&mut self, label: &str) -> &mut Self {
        if self.blocks.is_empty() {
            self.fail("edge declared before the first block".to_string());
            return self;
        }
        let taken = self
            .blocks
            .last()
            .is_some_and(|b| b.fallthrough.is_some());
        if taken {
            self.fail(format!("block already has a fallthrough ('{label}')"));
        } else if let Some(block) = self.blocks.last_mut() {
            block.fallthrough = Some(label.to_string());
        }
        self
    }

    fn resolve(&self, label: &str) -> Result<BlockId> {
        self.index
            .get(label)
            .map(|&i| BlockId::new(i))
            .ok_or_else(|| malformed_error!("unknown block label '{label}'"))
    }

    fn fail(&mut self, message: String) {
        if self.defect.is_none() {
            self.defect = Some(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_label_is_reported() {
        let mut builder = MethodBuilder::new();
        builder.block("a").br("missing");
        assert!(builder.finish().is_err());
    }

    #[test]
    fn test_duplicate_label_is_reported() {
        let mut builder = MethodBuilder::new();
        builder.block("a").ret();
        builder.block("a").ret();
        assert!(builder.finish().is_err());
    }

    #[test]
    fn test_switch_targets_keep_case_order() {
        let mut builder = MethodBuilder::new();
        builder.block("d").switch(&["c1", "c0"]).fall_through("c0");
        builder.block("c0").ret();
        builder.block("c1").ret();
        let body = builder.finish().unwrap();

        let d = body.block(BlockId::new(0));
        assert_eq!(d.targets, vec![BlockId::new(2), BlockId::new(1)]);
        assert_eq!(d.fallthrough, Some(BlockId::new(1)));
    }

    #[test]
    fn test_region_layout_only_when_regions_declared() {
        let mut builder = MethodBuilder::new();
        builder.block("a").ret();
        let body = builder.finish().unwrap();
        assert!(body.layout.is_empty());

        let mut builder = MethodBuilder::new();
        builder.block("a").nop().fall_through("t");
        builder.begin_region(RegionKind::Finally);
        builder.block("t").end_finally();
        builder.end_region();
        let body = builder.finish().unwrap();
        assert_eq!(body.layout.len(), 2);
    }
}
