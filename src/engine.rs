//! Engine entry points: per-method and whole-module deflattening.
//!
//! The [`Engine`] owns the pass list and the shared [`AnalysisContext`].
//! Methods are fully independent, so [`Engine::deobfuscate_all`] fans them
//! out to parallel workers; each worker owns its method's block graph and
//! records outcomes through the thread-safe context.

use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::{
    cfg::{MethodBody, MethodToken},
    config::EngineConfig,
    context::AnalysisContext,
    events::{Event, EventKind},
    pass::{DeflattenPass, MethodPass},
    Result,
};

/// Convenience wrapper: deflattens one method with default configuration.
///
/// Returns `true` if a dispatcher was found and removed (the block graph is
/// mutated in place), `false` if the method was left untouched - because the
/// fingerprint is absent, or because resolution had to fail closed. Callers
/// that need the distinction or the diagnostics should drive an [`Engine`]
/// and inspect its context.
pub fn try_deobfuscate(body: &mut MethodBody) -> bool {
    let engine = Engine::new(EngineConfig::default());
    engine.deobfuscate_method(body).unwrap_or(false)
}

/// Deflattening engine: pass list plus shared analysis context.
pub struct Engine {
    context: AnalysisContext,
    passes: Vec<Box<dyn MethodPass>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    /// Creates an engine with the given configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            context: AnalysisContext::new(config),
            passes: vec![Box::new(DeflattenPass::new())],
        }
    }

    /// The shared context, for event and outcome queries.
    #[must_use]
    pub fn context(&self) -> &AnalysisContext {
        &self.context
    }

    /// Runs all passes on one method.
    ///
    /// Returns `true` if any pass mutated the block graph. Obfuscation-
    /// induced failures have already been converted to events inside the
    /// passes; the method is untouched in that case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedLayout`](crate::Error::MalformedLayout) when
    /// the caller-supplied handler layout is structurally invalid.
    pub fn deobfuscate_method(&self, body: &mut MethodBody) -> Result<bool> {
        let mut changed = false;
        for pass in &self.passes {
            if !pass.should_run(body.token, &self.context) {
                continue;
            }
            changed |= pass.run_on_method(body, &self.context)?;
        }
        Ok(changed)
    }

    /// Runs all passes over every method in parallel.
    ///
    /// Per-method isolation is absolute: a failure in one method is recorded
    /// as an event and leaves that single method untouched; every other
    /// method proceeds normally.
    pub fn deobfuscate_all(&self, bodies: &mut [MethodBody]) -> EngineReport {
        let start = Instant::now();

        let mut outcomes: Vec<(MethodToken, bool)> = bodies
            .par_iter_mut()
            .map(|body| {
                let token = body.token;
                let changed = match self.deobfuscate_method(body) {
                    Ok(changed) => changed,
                    Err(error) => {
                        self.context.events.record(
                            Event::new(EventKind::ResolutionAborted, token)
                                .with_message(error.to_string()),
                        );
                        false
                    }
                };
                (token, changed)
            })
            .collect();
        outcomes.sort_by_key(|&(token, _)| token);

        let (deflattened, untouched) = outcomes
            .into_iter()
            .partition::<Vec<_>, _>(|&(_, changed)| changed);

        EngineReport {
            deflattened: deflattened.into_iter().map(|(t, _)| t).collect(),
            untouched: untouched.into_iter().map(|(t, _)| t).collect(),
            elapsed: start.elapsed(),
        }
    }
}

/// Outcome of a whole-module run: which methods were deflattened and which
/// were left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineReport {
    /// Methods whose dispatchers were removed, in token order.
    pub deflattened: Vec<MethodToken>,
    /// Methods left untouched (no fingerprint, or failed closed), in token
    /// order.
    pub untouched: Vec<MethodToken>,
    /// Wall-clock time of the run.
    pub elapsed: Duration,
}

impl EngineReport {
    /// One-line human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} method(s) deflattened, {} untouched in {:.1?}",
            self.deflattened.len(),
            self.untouched.len(),
            self.elapsed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::MethodBuilder;

    #[test]
    fn test_plain_method_is_untouched() {
        let mut builder = MethodBuilder::new();
        builder.token(0x0600_0001);
        builder.block("entry").load_const(1).fall_through("exit");
        builder.block("exit").ret();
        let mut body = builder.finish().unwrap();
        let original = body.clone();

        let engine = Engine::default();
        assert!(!engine.deobfuscate_method(&mut body).unwrap());
        assert_eq!(body, original);
        assert!(engine.context().events.is_empty());
    }

    #[test]
    fn test_report_summary_counts() {
        let report = EngineReport {
            deflattened: vec![MethodToken::new(1)],
            untouched: vec![MethodToken::new(2), MethodToken::new(3)],
            elapsed: Duration::from_millis(5),
        };
        assert!(report.summary().starts_with("1 method(s) deflattened, 2 untouched"));
    }
}
