//! Configuration for the deflattening engine.

/// Configuration controlling detection thresholds and defensive limits.
///
/// The defaults are tuned for the switch-dispatcher flattening family this
/// crate targets; [`EngineConfig::confuserex`] tightens them for the most
/// common producer of that family.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worklist dequeue budget as a multiple of the method's block count.
    ///
    /// The resolver terminates in O(block count) dequeues on well-formed
    /// input; the budget converts an unforeseen cycle in malformed input into
    /// a detection-failure result instead of an infinite loop.
    pub worklist_factor: usize,

    /// Maximum blocks on one traced path before the tracer abandons it.
    ///
    /// Bounds recursion when enumerating paths from a divergence point to the
    /// dispatcher.
    pub max_trace_depth: usize,

    /// Minimum case-table size for a multi-way branch to be considered a
    /// dispatcher.
    ///
    /// Flattened methods dispatch over at least a handful of states; tiny
    /// tables are far more likely to be ordinary user switches.
    pub min_switch_cases: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worklist_factor: 4,
            max_trace_depth: 64,
            min_switch_cases: 2,
        }
    }
}

impl EngineConfig {
    /// Configuration tightened for ConfuserEx-style output.
    ///
    /// ConfuserEx emits compact dispatch regions with predictable arithmetic,
    /// so shallower traces suffice and dispatchers always carry several
    /// cases.
    #[must_use]
    pub fn confuserex() -> Self {
        Self {
            worklist_factor: 3,
            max_trace_depth: 32,
            min_switch_cases: 3,
        }
    }
}
