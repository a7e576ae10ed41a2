//! Shared analysis state for one engine run.
//!
//! All collection fields use thread-safe types so parallel method workers can
//! record outcomes through a shared reference; methods are otherwise fully
//! independent (each worker owns its method's block graph).

use dashmap::DashSet;

use crate::{cfg::MethodToken, config::EngineConfig, events::EventLog};

/// Per-run analysis context shared by all passes and workers.
pub struct AnalysisContext {
    /// Engine configuration.
    pub config: EngineConfig,
    /// Accumulated events from all passes and methods.
    pub events: EventLog,
    /// Methods in which a dispatcher fingerprint was recognized, whether or
    /// not resolution succeeded.
    dispatchers: DashSet<MethodToken>,
    /// Methods whose dispatchers were successfully removed; skipped on
    /// subsequent pass iterations.
    deflattened: DashSet<MethodToken>,
}

impl AnalysisContext {
    /// Creates a context with the given configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        AnalysisContext {
            config,
            events: EventLog::new(),
            dispatchers: DashSet::new(),
            deflattened: DashSet::new(),
        }
    }

    /// Records that `token` carried a dispatcher fingerprint.
    pub fn mark_dispatcher(&self, token: MethodToken) {
        self.dispatchers.insert(token);
    }

    /// Returns `true` when a dispatcher was detected in `token`.
    #[must_use]
    pub fn is_dispatcher(&self, token: MethodToken) -> bool {
        self.dispatchers.contains(&token)
    }

    /// Records that `token` was successfully deflattened.
    pub fn mark_deflattened(&self, token: MethodToken) {
        self.deflattened.insert(token);
    }

    /// Returns `true` when `token` was already deflattened this run.
    #[must_use]
    pub fn is_deflattened(&self, token: MethodToken) -> bool {
        self.deflattened.contains(&token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marking_is_idempotent() {
        let ctx = AnalysisContext::new(EngineConfig::default());
        let token = MethodToken::new(1);
        assert!(!ctx.is_deflattened(token));
        ctx.mark_deflattened(token);
        ctx.mark_deflattened(token);
        assert!(ctx.is_deflattened(token));
        assert!(!ctx.is_dispatcher(MethodToken::new(2)));
    }
}
