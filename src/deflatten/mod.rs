//! Control-flow deflattening: detection, tracing, and dispatch resolution.
//!
//! # Algorithm Overview
//!
//! 1. **Scope construction**: partition the method's blocks along its
//!    exception-handler nesting ([`Scope::build`](crate::cfg::Scope::build))
//! 2. **Detection**: scan each scope, innermost first, for the dispatcher
//!    fingerprint ([`detect`]) - nested handler regions may carry their own
//!    independent dispatchers
//! 3. **Resolution**: for a matched scope, drive the worklist rewriter over
//!    every reachable dispatcher predecessor, replaying state computations
//!    through the abstract emulator and splicing direct edges
//! 4. **Commit**: all of the above runs on a clone; the caller's graph is
//!    replaced only when the whole method resolved cleanly
//!
//! # Design Principles
//!
//! - **Conservative detection**: the fingerprint must match exactly; a false
//!   positive would authorize a rewrite, so every ambiguity reads as "not
//!   flattened"
//! - **Fail closed**: an unclassifiable block, an unresolvable index, or an
//!   exhausted worklist budget abandons the clone and leaves the method
//!   byte-for-byte untouched
//! - **No guessing**: dispatch indices must reduce to concrete integers;
//!   `Unknown` stops a path, it never picks a default

pub mod detect;
pub mod resolve;
pub mod trace;

pub use detect::{detect, DispatcherDescriptor, Predicate};
pub use resolve::{BranchState, ResolveStats};
pub use trace::BranchTargetTracer;

use crate::{
    cfg::{BlockId, MethodBody, Scope},
    config::EngineConfig,
    deflatten::resolve::SwitchResolver,
    Result,
};

/// Summary of one recovered dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherSummary {
    /// The block that held the multi-way branch.
    pub block: BlockId,
    /// Number of entries in its case table.
    pub cases: usize,
    /// Predicate transform its header carried.
    pub predicate: Predicate,
    /// What resolving it changed.
    pub stats: ResolveStats,
}

/// Outcome of a successful [`unflatten_method`] run that found work to do.
#[derive(Debug, Clone, PartialEq)]
pub struct UnflattenOutcome {
    /// Every dispatcher recovered in this method, in resolution order
    /// (innermost scopes first).
    pub dispatchers: Vec<DispatcherSummary>,
}

impl UnflattenOutcome {
    /// Total indirect edges replaced across all recovered dispatchers.
    #[must_use]
    pub fn edges_resolved(&self) -> usize {
        self.dispatchers.iter().map(|d| d.stats.edges_resolved).sum()
    }
}

/// Detects and removes every dispatcher in `body`.
///
/// Returns `Ok(None)` when no scope carries the fingerprint - the method is
/// not flattened and is left untouched. Returns `Ok(Some(..))` after mutating
/// `body` in place with all dispatchers resolved.
///
/// The resolution runs on a private clone. On any error the clone is
/// discarded, `body` keeps its original structure, and the error describes
/// the first block that defeated classification; partial rewrites are never
/// committed.
///
/// # Errors
///
/// - [`Error::MalformedLayout`](crate::Error::MalformedLayout) for a
///   structurally invalid handler layout (caller bug)
/// - [`Error::UnclassifiedShape`](crate::Error::UnclassifiedShape),
///   [`Error::UnresolvedValue`](crate::Error::UnresolvedValue),
///   [`Error::CaseIndexOutOfRange`](crate::Error::CaseIndexOutOfRange),
///   [`Error::StackUnderflow`](crate::Error::StackUnderflow), and
///   [`Error::WorklistBudgetExceeded`](crate::Error::WorklistBudgetExceeded)
///   when a matched dispatcher cannot be resolved safely
pub fn unflatten_method(
    body: &mut MethodBody,
    config: &EngineConfig,
) -> Result<Option<UnflattenOutcome>> {
    let mut work = body.clone();
    let scope_tree = Scope::build(&mut work)?;

    let mut scopes = Vec::new();
    scope_tree.for_each_post_order(&mut |scope| scopes.push(scope.clone()));

    let mut dispatchers = Vec::new();
    for scope in &scopes {
        // A scope may hold several dispatchers in sequence; each successful
        // resolution strips one, so re-detect until the fingerprint is gone.
        while let Some(descriptor) = detect(&work, scope, config.min_switch_cases) {
            let resolver = SwitchResolver::new(&mut work, &descriptor, scope, config);
            let stats = resolver.run()?;
            dispatchers.push(DispatcherSummary {
                block: descriptor.block,
                cases: descriptor.cases.len(),
                predicate: descriptor.predicate,
                stats,
            });
        }
    }

    if dispatchers.is_empty() {
        return Ok(None);
    }

    *body = work;
    Ok(Some(UnflattenOutcome { dispatchers }))
}
