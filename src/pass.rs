//! Pass trait and the deflattening pass.
//!
//! The engine drives a small, fixed pass list per method. Passes are
//! thread-safe so independent methods can be processed by parallel workers,
//! and every pass honors the per-method error boundary: a failure inside one
//! method becomes an event plus an untouched method, never an error that
//! escapes to a sibling method.

use crate::{
    cfg::MethodBody,
    cfg::MethodToken,
    context::AnalysisContext,
    deflatten::unflatten_method,
    events::{Event, EventKind},
    Error, Result,
};

/// A transformation over one method's block graph.
///
/// Implementations must be `Send + Sync`; the engine may run them from
/// parallel workers, one method per worker.
pub trait MethodPass: Send + Sync {
    /// Unique name for reporting.
    fn name(&self) -> &'static str;

    /// What this pass does.
    fn description(&self) -> &'static str {
        "No description available"
    }

    /// Should this pass run on a specific method?
    ///
    /// Called before [`run_on_method`](MethodPass::run_on_method); override
    /// to skip methods that were already handled.
    fn should_run(&self, _token: MethodToken, _ctx: &AnalysisContext) -> bool {
        true
    }

    /// Runs the pass on one method.
    ///
    /// Returns `true` if the block graph was mutated. Outcomes worth
    /// reporting are recorded to `ctx.events`.
    ///
    /// # Errors
    ///
    /// Returns an error only for contract violations by the caller (e.g. a
    /// malformed handler layout); obfuscation-induced failures are converted
    /// to events and `Ok(false)` inside the pass.
    fn run_on_method(&self, body: &mut MethodBody, ctx: &AnalysisContext) -> Result<bool>;
}

/// The dispatcher-removal pass.
///
/// Wraps [`unflatten_method`] with the per-method error boundary: a method
/// whose dispatcher cannot be resolved safely is reported via
/// [`EventKind::ResolutionAborted`] and left untouched.
#[derive(Debug, Default)]
pub struct DeflattenPass;

impl DeflattenPass {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        DeflattenPass
    }
}

impl MethodPass for DeflattenPass {
    fn name(&self) -> &'static str {
        "deflatten"
    }

    fn description(&self) -> &'static str {
        "Removes switch dispatchers and restores direct control flow"
    }

    fn should_run(&self, token: MethodToken, ctx: &AnalysisContext) -> bool {
        !ctx.is_deflattened(token)
    }

    fn run_on_method(&self, body: &mut MethodBody, ctx: &AnalysisContext) -> Result<bool> {
        let token = body.token;
        match unflatten_method(body, &ctx.config) {
            Ok(Some(outcome)) => {
                ctx.mark_dispatcher(token);
                ctx.mark_deflattened(token);
                for dispatcher in &outcome.dispatchers {
                    ctx.events.record(
                        Event::new(EventKind::DispatcherDetected, token)
                            .with_block(dispatcher.block)
                            .with_message(format!("{} cases", dispatcher.cases)),
                    );
                }
                ctx.events.record(
                    Event::new(EventKind::MethodDeflattened, token).with_message(format!(
                        "{} dispatcher(s), {} edge(s) resolved",
                        outcome.dispatchers.len(),
                        outcome.edges_resolved()
                    )),
                );
                Ok(true)
            }
            Ok(None) => Ok(false),
            // A malformed handler layout is a caller-contract violation, not
            // an obfuscation artifact; it propagates for the caller to fix.
            Err(error @ Error::MalformedLayout { .. }) => Err(error),
            Err(error) => {
                // The clone was discarded and the method is intact; the
                // diagnostic lands in the log instead of crossing the method
                // boundary.
                ctx.mark_dispatcher(token);
                ctx.events.record(
                    Event::new(EventKind::ResolutionAborted, token)
                        .with_message(error.to_string()),
                );
                Ok(false)
            }
        }
    }
}
