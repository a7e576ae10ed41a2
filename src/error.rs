use thiserror::Error;

use crate::cfg::BlockId;

/// The generic Error type covering every failure this library can report.
///
/// Inputs originate from untrusted, adversarial binaries, so every variant is a
/// reported, recoverable condition - nothing here is allowed to escape a
/// per-method boundary as a panic. The engine converts these into events and a
/// "method left untouched" outcome; only callers driving the lower-level
/// operations directly observe them as errors.
///
/// # Error Categories
///
/// ## Structural Errors
/// - [`Error::MalformedLayout`] - The caller-supplied block list or handler
///   region layout violates a structural invariant
/// - [`Error::StackUnderflow`] - An instruction sequence pops more values than
///   the abstract evaluation stack holds
///
/// ## Resolution Errors
/// - [`Error::UnresolvedValue`] - A dispatch index depends on runtime-only data
/// - [`Error::UnclassifiedShape`] - A block matches no known obfuscator idiom
/// - [`Error::CaseIndexOutOfRange`] - A resolved index exceeds the dispatcher's
///   case table
/// - [`Error::WorklistBudgetExceeded`] - The defensive iteration cap tripped on
///   a malformed or cyclic input
#[derive(Error, Debug)]
pub enum Error {
    /// The block list or exception-handler region layout is structurally invalid.
    ///
    /// This indicates a bug or hostile input in the collaborating block builder:
    /// a block referenced twice, an unknown block id, or a region covering no
    /// blocks it claims to own.
    #[error("Malformed block layout - {message} ({file}:{line})")]
    MalformedLayout {
        /// Description of the violated invariant.
        message: String,
        /// Source file where the violation was detected.
        file: &'static str,
        /// Source line where the violation was detected.
        line: u32,
    },

    /// The abstract emulator could not reduce a dispatch index to a concrete
    /// integer; the value depends on runtime-only data. Resolution of the
    /// affected path must not guess.
    #[error("dispatch index depends on a runtime-only value")]
    UnresolvedValue,

    /// A reachable block matches none of the known obfuscator-revision idioms.
    /// The enclosing method is left unmodified.
    #[error("block {block} matches no known dispatcher idiom")]
    UnclassifiedShape {
        /// The block that defeated classification.
        block: BlockId,
    },

    /// A resolved dispatch index fell outside the dispatcher's case table.
    /// Table indices are attacker-controlled, so this is reported rather than
    /// trusted.
    #[error("dispatch index {index} exceeds case table of length {table_len}")]
    CaseIndexOutOfRange {
        /// The concrete index produced by header emulation.
        index: u64,
        /// Number of entries in the dispatcher's case table.
        table_len: usize,
    },

    /// An instruction sequence popped more values than the abstract evaluation
    /// stack holds.
    #[error("abstract evaluation stack underflow")]
    StackUnderflow,

    /// The resolver's worklist exceeded its defensive dequeue budget, which
    /// converts a potential infinite loop on malformed input into a
    /// detection-failure result.
    #[error("worklist exceeded its budget of {limit} dequeues")]
    WorklistBudgetExceeded {
        /// The budget that was exhausted, proportional to the block count.
        limit: usize,
    },
}
