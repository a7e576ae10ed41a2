//! Acyclic path enumeration toward the dispatcher.
//!
//! When a conditional branch diverges, the state value that eventually feeds
//! the dispatcher is computed somewhere down each arm. The tracer enumerates
//! every acyclic block sequence from a divergence point until it reaches the
//! dispatcher, a terminal instruction, or the edge of the scope; the resolver
//! then classifies each path by its last block.

use std::collections::HashSet;

use crate::cfg::{BlockId, MethodBody};

/// Enumerates acyclic block paths from a start block to the dispatcher.
///
/// Paths that reach the dispatcher exclude it; paths that die at a terminal
/// instruction end with the terminal block. Blocks already rewritten by the
/// resolver are dead ends (their state edges are gone), so the tracer shares
/// the resolver's processed set and cuts paths that touch it.
pub struct BranchTargetTracer<'a> {
    body: &'a MethodBody,
    scope_blocks: &'a HashSet<BlockId>,
    dispatcher: BlockId,
    processed: &'a HashSet<BlockId>,
    max_depth: usize,
}

impl<'a> BranchTargetTracer<'a> {
    /// Creates a tracer over `scope_blocks` with `dispatcher` as the sink.
    #[must_use]
    pub fn new(
        body: &'a MethodBody,
        scope_blocks: &'a HashSet<BlockId>,
        dispatcher: BlockId,
        processed: &'a HashSet<BlockId>,
        max_depth: usize,
    ) -> Self {
        BranchTargetTracer {
            body,
            scope_blocks,
            dispatcher,
            processed,
            max_depth,
        }
    }

    /// Collects every acyclic path leaving `start`.
    ///
    /// The walk follows fallthrough edges linearly, forks at conditional
    /// branches with a duplicated prefix, and discards a path that revisits a
    /// block within the same trace or exceeds the depth cap.
    #[must_use]
    pub fn trace_from(&self, start: BlockId) -> Vec<Vec<BlockId>> {
        let mut traces = Vec::new();
        self.walk(Vec::new(), start, &mut traces);
        traces
    }

    fn walk(&self, mut chain: Vec<BlockId>, mut current: BlockId, traces: &mut Vec<Vec<BlockId>>) {
        loop {
            if current == self.dispatcher {
                traces.push(chain);
                return;
            }
            if chain.contains(&current)
                || self.processed.contains(&current)
                || !self.scope_blocks.contains(&current)
                || chain.len() >= self.max_depth
            {
                // Cycle, already-rewritten block, scope exit, or runaway
                // depth: nothing down here can feed the dispatcher anymore.
                return;
            }

            chain.push(current);
            let block = self.body.block(current);

            if block.is_conditional_branch() {
                if let Some(&taken) = block.targets.first() {
                    self.walk(chain.clone(), taken, traces);
                }
                match block.fallthrough {
                    Some(ft) => current = ft,
                    None => return,
                }
                continue;
            }

            if let Some(last) = block.last() {
                if last.opcode.is_terminal() || block.is_multiway_branch() {
                    traces.push(chain);
                    return;
                }
            }

            match block.only_target() {
                Some(next) => current = next,
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{MethodBuilder, Scope};

    fn setup(builder: &MethodBuilder) -> (MethodBody, HashSet<BlockId>) {
        let mut body = builder.finish().unwrap();
        let scope = Scope::build(&mut body).unwrap();
        let blocks = scope.blocks.iter().copied().collect();
        (body, blocks)
    }

    #[test]
    fn test_conditional_forks_into_two_traces() {
        let mut builder = MethodBuilder::new();
        builder.block("fork").cond_br("right").fall_through("left");
        builder.block("left").load_const(1).br("dispatcher");
        builder.block("right").load_const(2).br("dispatcher");
        builder.block("dispatcher").ret();
        let (body, blocks) = setup(&builder);

        let processed = HashSet::new();
        let dispatcher = BlockId::new(3);
        let tracer = BranchTargetTracer::new(&body, &blocks, dispatcher, &processed, 32);
        let mut traces = tracer.trace_from(BlockId::new(0));
        traces.sort();

        assert_eq!(traces.len(), 2);
        // Both paths end at the state-producing block before the dispatcher.
        assert_eq!(traces[0], vec![BlockId::new(0), BlockId::new(1)]);
        assert_eq!(traces[1], vec![BlockId::new(0), BlockId::new(2)]);
    }

    #[test]
    fn test_cycles_are_discarded() {
        let mut builder = MethodBuilder::new();
        builder.block("a").cond_br("a").fall_through("b");
        builder.block("b").ret();
        builder.block("dispatcher").ret();
        let (body, blocks) = setup(&builder);

        let processed = HashSet::new();
        let tracer =
            BranchTargetTracer::new(&body, &blocks, BlockId::new(2), &processed, 32);
        let traces = tracer.trace_from(BlockId::new(0));

        // The self-loop arm dies; only the terminal arm survives.
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0], vec![BlockId::new(0), BlockId::new(1)]);
    }

    #[test]
    fn test_processed_blocks_cut_paths() {
        let mut builder = MethodBuilder::new();
        builder.block("a").nop().fall_through("b");
        builder.block("b").nop().fall_through("dispatcher");
        builder.block("dispatcher").ret();
        let (body, blocks) = setup(&builder);

        let processed: HashSet<_> = [BlockId::new(1)].into();
        let tracer =
            BranchTargetTracer::new(&body, &blocks, BlockId::new(2), &processed, 32);
        assert!(tracer.trace_from(BlockId::new(0)).is_empty());
    }
}
