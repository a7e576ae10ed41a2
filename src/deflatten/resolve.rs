//! The dispatch resolver: a breadth-first worklist rewriter.
//!
//! For every reachable predecessor of the dispatcher, the resolver replays the
//! relevant instructions through the abstract emulator, computes the concrete
//! next-state value, looks up the true successor in the case table, and
//! splices a direct edge in place of the indirect one. Blocks are classified
//! by structural shape; a shape matching no known obfuscator revision aborts
//! the method with [`Error::UnclassifiedShape`] - the caller commits nothing
//! in that case, so classification failure can never corrupt a method.

use std::collections::{HashSet, VecDeque};

use crate::{
    cfg::{BlockFlags, BlockId, MethodBody, RegionKind, Scope},
    config::EngineConfig,
    deflatten::{detect::DispatcherDescriptor, trace::BranchTargetTracer},
    emulator::{AbstractValue, Emulator},
    il::{Instruction, OpCode},
    Error, Result,
};

/// One unit of worklist work: a block to classify plus the state-local value
/// it is entered with.
///
/// Created when a predecessor's next-state value becomes computable, consumed
/// exactly once; the processed set prevents re-enqueued blocks from being
/// classified twice.
#[derive(Debug, Clone, Copy)]
pub struct BranchState {
    /// The block awaiting classification.
    pub block: BlockId,
    /// The state local's value on entry to that block.
    pub state: AbstractValue,
}

/// Counters describing what one resolution changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    /// Indirect edges replaced by direct branches.
    pub edges_resolved: usize,
    /// Pure state-selection blocks emptied and bypassed entirely.
    pub blocks_elided: usize,
}

/// State-update tail variants the obfuscator emits.
///
/// `Full` is self-contained (`load-local, const, mul, const, xor`); `Partial`
/// consumes one stack operand pushed by a predecessor arm (`load-local,
/// const, mul, xor`) and is therefore only resolvable together with that arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateTail {
    Full,
    Partial,
}

pub(crate) struct SwitchResolver<'a> {
    body: &'a mut MethodBody,
    descriptor: &'a DispatcherDescriptor,
    scope_blocks: HashSet<BlockId>,
    scope_first: Option<BlockId>,
    scope_kind: RegionKind,
    emulator: Emulator,
    queue: VecDeque<BranchState>,
    processed: HashSet<BlockId>,
    tampered: HashSet<BlockId>,
    budget: usize,
    max_trace_depth: usize,
    stats: ResolveStats,
}

impl<'a> SwitchResolver<'a> {
    pub(crate) fn new(
        body: &'a mut MethodBody,
        descriptor: &'a DispatcherDescriptor,
        scope: &Scope,
        config: &EngineConfig,
    ) -> Self {
        let emulator = Emulator::new(body.locals.len(), descriptor.width);
        let budget = config
            .worklist_factor
            .saturating_mul(body.block_count())
            .max(16);
        SwitchResolver {
            emulator,
            budget,
            scope_blocks: scope.blocks.iter().copied().collect(),
            scope_first: scope.blocks.first().copied(),
            scope_kind: scope.kind,
            body,
            descriptor,
            queue: VecDeque::new(),
            processed: HashSet::new(),
            tampered: HashSet::new(),
            max_trace_depth: config.max_trace_depth,
            stats: ResolveStats::default(),
        }
    }

    /// Drains the worklist, rewiring every classified block, then strips the
    /// dispatcher. Any error leaves the (caller-cloned) body abandoned.
    pub(crate) fn run(mut self) -> Result<ResolveStats> {
        self.seed()?;

        let mut dequeues = 0usize;
        while let Some(branch) = self.queue.pop_front() {
            dequeues += 1;
            if dequeues > self.budget {
                return Err(Error::WorklistBudgetExceeded { limit: self.budget });
            }
            if self.processed.contains(&branch.block) {
                continue;
            }
            // Replays are independent of each other: fresh stack, restored
            // state local.
            self.emulator.clear_stack();
            self.emulator
                .set_local(self.descriptor.state_local, branch.state);
            self.process_block(branch.block)?;
            self.processed.insert(branch.block);
        }

        self.finalize();
        Ok(self.stats)
    }

    /// Seeds the queue with the dispatcher's state-independent entry
    /// predecessors: blocks that push a constant raw state. Predecessors that
    /// read the state local are reached later, once a known state flows into
    /// them.
    fn seed(&mut self) -> Result<()> {
        let mut seeds: Vec<BlockId> = self
            .body
            .block(self.descriptor.block)
            .predecessors
            .iter()
            .copied()
            .filter(|&p| p != self.descriptor.block && self.scope_blocks.contains(&p))
            .filter(|&p| {
                self.body
                    .block(p)
                    .body_tail()
                    .last()
                    .is_some_and(Instruction::is_load_const)
            })
            .collect();
        seeds.sort();
        seeds.dedup();

        if seeds.is_empty() {
            // A dispatcher nothing constant-feeding enters is not the idiom
            // we matched; refuse to touch the method.
            return Err(Error::UnclassifiedShape {
                block: self.descriptor.block,
            });
        }
        for seed in seeds {
            self.queue.push_back(BranchState {
                block: seed,
                state: AbstractValue::Unknown,
            });
        }
        Ok(())
    }

    fn process_block(&mut self, current: BlockId) -> Result<()> {
        if self.state_tail(current) == Some(StateTail::Full) {
            return self.process_state_update(current);
        }

        if self.body.block(current).is_conditional_branch() {
            if self.process_conditional_via_traces(current)? {
                return Ok(());
            }
            return self.process_conditional_roots(current);
        }

        if let Some(alone) = self.single_const_shape(current) {
            return self.process_single_const(current, alone);
        }

        if self.is_terminal_shape(current) {
            return Ok(());
        }

        let block = self.body.block(current);
        if block.is_nop_block() {
            if block.has_only_source(self.descriptor.block) {
                return Ok(());
            }
            if let Some(ft) = block.fallthrough {
                return self.enqueue(ft);
            }
        }

        if block.is_multiway_branch() {
            // A second multi-way branch inside a traced region is a nested
            // dispatcher artifact; defer each target to its own
            // classification.
            let mut successors = block.targets.clone();
            successors.extend(block.fallthrough);
            for target in successors {
                self.enqueue(target)?;
            }
            return Ok(());
        }

        if block.is_fallthrough_only() {
            if let Some(ft) = block.fallthrough {
                return self.enqueue(ft);
            }
        }

        Err(Error::UnclassifiedShape { block: current })
    }

    // ----- shape predicates ------------------------------------------------

    /// Matches the xor/mul state-update idiom at the end of `current`,
    /// requiring the block to fall into the dispatcher.
    fn state_tail(&self, current: BlockId) -> Option<StateTail> {
        let block = self.body.block(current);
        if block.fallthrough != Some(self.descriptor.block) || !block.targets.is_empty() {
            return None;
        }
        let tail = block.body_tail();
        let n = tail.len();
        let state_load =
            |i: &Instruction| i.opcode == OpCode::LoadLocal && i.local_slot() == Some(self.descriptor.state_local);

        if n >= 5
            && tail[n - 1].opcode == OpCode::Xor
            && tail[n - 2].is_load_const()
            && tail[n - 3].opcode == OpCode::Mul
            && tail[n - 4].is_load_const()
            && state_load(&tail[n - 5])
        {
            return Some(StateTail::Full);
        }
        if n >= 4
            && tail[n - 1].opcode == OpCode::Xor
            && tail[n - 2].opcode == OpCode::Mul
            && tail[n - 3].is_load_const()
            && state_load(&tail[n - 4])
        {
            return Some(StateTail::Partial);
        }
        None
    }

    /// Matches a block whose dispatch contribution is a single trailing
    /// constant. Returns whether the block is *only* that constant (which
    /// allows bypassing it entirely).
    fn single_const_shape(&self, current: BlockId) -> Option<bool> {
        let block = self.body.block(current);
        if block.only_target() != Some(self.descriptor.block) {
            return None;
        }
        let tail = block.body_tail();
        if !tail.last().is_some_and(Instruction::is_load_const) {
            return None;
        }
        Some(tail.len() == 1)
    }

    fn is_terminal_shape(&self, current: BlockId) -> bool {
        let block = self.body.block(current);
        let Some(last) = block.last() else {
            return false;
        };
        match last.opcode {
            OpCode::Ret | OpCode::Throw => block.out_degree() == 0,
            OpCode::Leave => matches!(
                self.scope_kind,
                RegionKind::Try | RegionKind::Catch | RegionKind::Filter | RegionKind::Fault
            ),
            OpCode::Rethrow => matches!(
                self.scope_kind,
                RegionKind::Catch | RegionKind::Fault | RegionKind::Filter
            ),
            OpCode::EndFinally => {
                matches!(self.scope_kind, RegionKind::Finally | RegionKind::Fault)
            }
            _ => false,
        }
    }

    // ----- shape handlers --------------------------------------------------

    /// Self-contained state update falling into the dispatcher: replay the
    /// idiom plus the header, then branch straight to the resolved case.
    fn process_state_update(&mut self, current: BlockId) -> Result<()> {
        let block = self.body.block(current);
        let trailing = block.trailing_branch_len();
        let tail = block.body_tail();
        let replay: Vec<Instruction> = tail[tail.len() - 5..].to_vec();
        let pure = block.instructions.len() == 5 + trailing;
        let bypass_pred = block
            .only_predecessor()
            .filter(|&p| p != self.descriptor.block)
            .filter(|&p| self.body.block(p).fallthrough == Some(current));

        self.emulator.execute(&replay)?;
        let index = self.descriptor.emulate_header(&mut self.emulator)?;
        let target = self.descriptor.case(index)?;

        if pure {
            if let Some(pred) = bypass_pred {
                // The block exists only to select the next state; point its
                // predecessor at the resolved target and retire it.
                self.body.set_fallthrough(pred, Some(target));
                self.body.elide_block(current);
                self.stats.blocks_elided += 1;
                self.tampered.insert(current);
                self.stats.edges_resolved += 1;
                return self.enqueue(target);
            }
        }

        self.body.replace_last_with_branch(current, 5 + trailing, target);
        self.tampered.insert(current);
        self.stats.edges_resolved += 1;
        self.enqueue(target)
    }

    /// Trailing-constant shape; when the block is nothing but the constant,
    /// fallthrough predecessors are re-pointed past it as well.
    fn process_single_const(&mut self, current: BlockId, alone: bool) -> Result<()> {
        let block = self.body.block(current);
        let trailing = block.trailing_branch_len();
        let Some(&constant) = block.body_tail().last() else {
            return Err(Error::UnclassifiedShape { block: current });
        };

        self.emulator.execute(&[constant])?;
        let index = self.descriptor.emulate_header(&mut self.emulator)?;
        let target = self.descriptor.case(index)?;

        self.body
            .replace_last_with_branch(current, 1 + trailing, target);
        self.tampered.insert(current);
        self.stats.edges_resolved += 1;

        if alone {
            // Dead-block elision: anything that fell into this constant-only
            // block can go straight to the resolved target.
            for pred in self.body.block(current).predecessors.clone() {
                if pred != self.descriptor.block
                    && pred != current
                    && self.body.block(pred).fallthrough == Some(current)
                {
                    self.body.set_fallthrough(pred, Some(target));
                }
            }
        }

        self.enqueue(target)
    }

    /// Replays `first` then `second` (a state-producing join) through the
    /// header and rewires `first` directly to the resolved case. The state
    /// local is restored afterwards so the sibling arm resolves from the same
    /// entry state.
    fn resolve_pair_through(&mut self, first: BlockId, second: BlockId) -> Result<()> {
        let saved = self.emulator.local(self.descriptor.state_local);
        self.emulator.clear_stack();

        let first_instrs = self.body.block(first).instructions.clone();
        let second_instrs = self.body.block(second).instructions.clone();
        self.emulator.execute(&first_instrs)?;
        self.emulator.execute(&second_instrs)?;
        let index = self.descriptor.emulate_header(&mut self.emulator)?;
        let target = self.descriptor.case(index)?;

        self.body
            .replace_last_with_branch(first, first_instrs.len(), target);
        self.tampered.insert(first);
        self.stats.edges_resolved += 1;
        self.enqueue(target)?;

        self.emulator
            .set_local(self.descriptor.state_local, saved);
        Ok(())
    }

    /// Trace-driven conditional handling. Returns `true` when every arm was
    /// dealt with; `false` defers to the shared-root logic.
    fn process_conditional_via_traces(&mut self, current: BlockId) -> Result<bool> {
        if self
            .body
            .block(current)
            .targets
            .contains(&self.descriptor.block)
        {
            return Ok(false);
        }

        let traces = {
            let tracer = BranchTargetTracer::new(
                self.body,
                &self.scope_blocks,
                self.descriptor.block,
                &self.processed,
                self.max_trace_depth,
            );
            tracer.trace_from(current)
        };
        if traces.is_empty() {
            // No path feeds the dispatcher; the arms die at terminals or
            // leave the scope on their own.
            return Ok(true);
        }

        // Constant-selection pattern: each arm pushes its candidate state
        // (`const, dup`), both arms converge on a shared `pop` join that
        // falls into the dispatcher. Each arm resolves independently.
        if let [a, b] = traces.as_slice() {
            if a.len() == 3 && b.len() == 3 && a.last() == b.last() {
                let join = *a.last().ok_or(Error::UnclassifiedShape { block: current })?;
                let join_pops = self
                    .body
                    .block(join)
                    .instructions
                    .first()
                    .is_some_and(|i| i.opcode == OpCode::Pop);
                let has_const = |id: BlockId| {
                    self.body
                        .block(id)
                        .instructions
                        .iter()
                        .any(Instruction::is_load_const)
                };
                if join_pops && has_const(a[1]) && has_const(b[1]) {
                    self.resolve_pair_through(a[1], join)?;
                    self.resolve_pair_through(b[1], join)?;
                    return Ok(true);
                }
            }
        }

        let mut handled = false;
        for trace in &traces {
            let Some(&last) = trace.last() else {
                continue;
            };

            // State-independent or self-contained producers re-enter the
            // worklist under the current state.
            let last_block = self.body.block(last);
            if last_block
                .body_tail()
                .last()
                .is_some_and(Instruction::is_load_const)
                || self.state_tail(last) == Some(StateTail::Full)
            {
                self.enqueue(last)?;
                handled = true;
                continue;
            }

            // Producers that consume the arm's pushed constant resolve as a
            // pair with the penultimate block of the trace.
            if trace.len() > 2 {
                let pen = trace[trace.len() - 2];
                let pop_only = {
                    let tail = self.body.block(last).body_tail();
                    tail.len() == 1 && tail[0].opcode == OpCode::Pop
                };
                if pop_only || self.state_tail(last) == Some(StateTail::Partial) {
                    if !self.body.block(pen).is_conditional_branch()
                        && self
                            .body
                            .block(pen)
                            .instructions
                            .iter()
                            .any(Instruction::is_load_const)
                    {
                        self.resolve_pair_through(pen, last)?;
                        handled = true;
                        continue;
                    }
                    if self.body.block(pen).is_nop_block() && self.tampered.contains(&pen) {
                        // Already rewritten on an earlier path.
                        handled = true;
                        continue;
                    }
                }
            }

            if self
                .body
                .block(last)
                .last()
                .is_some_and(|i| i.opcode.is_terminal())
            {
                continue;
            }
        }
        Ok(handled)
    }

    /// Shared-root conditional handling: both arms converge on one block that
    /// falls into the dispatcher, so each arm's instructions plus the root
    /// compute that arm's next state. Divergent arms re-enter the worklist
    /// independently - an obfuscator revision may omit the shared root, and
    /// guessing would be worse than deferring.
    fn process_conditional_roots(&mut self, current: BlockId) -> Result<()> {
        let block = self.body.block(current);
        let (Some(&taken), Some(ft)) = (block.targets.first(), block.fallthrough) else {
            return Err(Error::UnclassifiedShape { block: current });
        };
        let (a, b) = (ft, taken);

        if self.processed.contains(&a) && self.processed.contains(&b) {
            return Ok(());
        }
        if !self.scope_blocks.contains(&a) && !self.scope_blocks.contains(&b) {
            return Ok(());
        }
        let exits = |id: BlockId| {
            self.body
                .block(id)
                .last()
                .is_some_and(|i| i.opcode.is_scope_exit())
        };
        if exits(a) && exits(b) {
            return Ok(());
        }

        let root_a = self.body.block(a).only_target();
        let root_b = self.body.block(b).only_target();

        if root_a.is_none() || root_a != root_b {
            return self.process_divergent_arms(a, b, root_a);
        }
        let root = root_a.ok_or(Error::UnclassifiedShape { block: current })?;

        if root == self.descriptor.block {
            self.enqueue(a)?;
            return self.enqueue(b);
        }
        let root_block = self.body.block(root);
        if root_block.is_conditional_branch()
            && root_block.fallthrough != Some(self.descriptor.block)
        {
            return self.enqueue(root);
        }
        if root_block
            .last()
            .is_some_and(|i| i.opcode.is_scope_exit())
        {
            return Ok(());
        }
        if let Some(root_ft) = root_block.fallthrough {
            if root_ft != self.descriptor.block && !self.scope_blocks.contains(&root_ft) {
                return Ok(());
            }
        }

        if self.body.block(root).fallthrough == Some(self.descriptor.block) {
            self.resolve_pair_through(a, root)?;
            return self.resolve_pair_through(b, root);
        }

        // Shared root that does not feed the dispatcher: fall back to
        // independent re-entry.
        self.enqueue_in_scope(b)?;
        self.enqueue_in_scope(a)
    }

    fn process_divergent_arms(
        &mut self,
        a: BlockId,
        b: BlockId,
        root_a: Option<BlockId>,
    ) -> Result<()> {
        if self.body.block(a).fallthrough == Some(self.descriptor.block) {
            return self.enqueue(a);
        }
        let exits = |id: BlockId| {
            self.body
                .block(id)
                .last()
                .is_some_and(|i| i.opcode.is_scope_exit())
        };
        if root_a.is_none() && exits(a) {
            return self.enqueue(b);
        }
        if self.body.block(a).fallthrough == Some(b) {
            let b_block = self.body.block(b);
            if b_block.only_target() == Some(self.descriptor.block)
                && b_block
                    .body_tail()
                    .last()
                    .is_some_and(Instruction::is_load_const)
            {
                return self.enqueue(b);
            }
            if b_block.is_conditional_branch() {
                return self.enqueue(b);
            }
            if exits(b) {
                return Ok(());
            }
        }
        // Best effort: treat each arm as an independent worklist re-entry.
        self.enqueue_in_scope(b)?;
        self.enqueue_in_scope(a)
    }

    // ----- plumbing --------------------------------------------------------

    /// Queues `target` with the emulator's current state-local value.
    /// Out-of-scope targets belong to someone else and are left alone.
    fn enqueue(&mut self, target: BlockId) -> Result<()> {
        if target == self.descriptor.block {
            // Classification should have consumed the dispatcher edge before
            // ever queueing it; reaching here means the shape lied.
            return Err(Error::UnclassifiedShape { block: target });
        }
        if !self.scope_blocks.contains(&target) {
            return Ok(());
        }
        let state = self.emulator.local(self.descriptor.state_local);
        self.queue.push_back(BranchState {
            block: target,
            state,
        });
        Ok(())
    }

    fn enqueue_in_scope(&mut self, target: BlockId) -> Result<()> {
        if self.scope_blocks.contains(&target) {
            self.enqueue(target)?;
        }
        Ok(())
    }

    /// Strips the drained dispatcher and marks the blocks only it reached as
    /// dead for the external elimination pass.
    fn finalize(&mut self) {
        let dispatcher = self.descriptor.block;
        self.body.retire_outgoing(dispatcher);
        let block = self.body.block_mut(dispatcher);
        block.instructions.clear();
        block.flags |= BlockFlags::DISPATCHER | BlockFlags::DEAD;

        let entry = self.body.entry;
        for &id in &self.scope_blocks {
            if id == entry || Some(id) == self.scope_first || id == dispatcher {
                continue;
            }
            if self.body.block(id).predecessors.is_empty() {
                self.body.block_mut(id).flags |= BlockFlags::DEAD;
            }
        }
    }
}
