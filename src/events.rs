//! Structured event reporting for engine runs.
//!
//! The engine records what it did - and what it refused to do - as events in
//! an append-only log rather than writing to a logging facade. Parallel
//! method workers record through a shared reference without synchronization;
//! consumers query the log afterwards for per-method outcomes or a summary.

use std::fmt;

use crate::cfg::{BlockId, MethodToken};

/// Categories of events the engine records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A dispatcher fingerprint was recognized in a method.
    DispatcherDetected,
    /// A method was deflattened and its graph mutated in place.
    MethodDeflattened,
    /// Resolution was aborted and the method left untouched.
    ResolutionAborted,
    /// Informational message.
    Info,
}

impl EventKind {
    /// Human-readable description of this event kind.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::DispatcherDetected => "dispatcher detected",
            Self::MethodDeflattened => "method deflattened",
            Self::ResolutionAborted => "resolution aborted",
            Self::Info => "info",
        }
    }
}

/// One recorded event.
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// The method it happened in.
    pub method: MethodToken,
    /// The block it concerns, when one is identifiable.
    pub block: Option<BlockId>,
    /// Free-form detail.
    pub message: String,
}

impl Event {
    /// Creates an event for `method`.
    #[must_use]
    pub fn new(kind: EventKind, method: MethodToken) -> Self {
        Event {
            kind,
            method,
            block: None,
            message: String::new(),
        }
    }

    /// Attaches the block this event concerns.
    #[must_use]
    pub fn with_block(mut self, block: BlockId) -> Self {
        self.block = Some(block);
        self
    }

    /// Attaches free-form detail.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.method, self.kind.description())?;
        if let Some(block) = self.block {
            write!(f, " at {block}")?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

/// Append-only event collection shared across parallel method workers.
#[derive(Debug, Default)]
pub struct EventLog {
    events: boxcar::Vec<Event>,
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        EventLog::default()
    }

    /// Appends an event; callable through a shared reference.
    pub fn record(&self, event: Event) {
        self.events.push(event);
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.count()
    }

    /// Returns `true` when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates recorded events in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(|(_, event)| event)
    }

    /// Counts events of one kind.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.iter().filter(|e| e.kind == kind).count()
    }

    /// One-line summary of the log's contents.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} deflattened, {} detected, {} aborted",
            self.count(EventKind::MethodDeflattened),
            self.count(EventKind::DispatcherDetected),
            self.count(EventKind::ResolutionAborted),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_query() {
        let log = EventLog::new();
        let token = MethodToken::new(0x0600_0001);
        log.record(Event::new(EventKind::DispatcherDetected, token).with_block(BlockId::new(3)));
        log.record(
            Event::new(EventKind::MethodDeflattened, token).with_message("2 edges resolved"),
        );

        assert_eq!(log.len(), 2);
        assert_eq!(log.count(EventKind::DispatcherDetected), 1);
        assert_eq!(log.summary(), "1 deflattened, 1 detected, 0 aborted");
    }

    #[test]
    fn test_event_display() {
        let token = MethodToken::new(0x0600_0002);
        let event = Event::new(EventKind::ResolutionAborted, token)
            .with_block(BlockId::new(7))
            .with_message("unresolved value");
        let text = event.to_string();
        assert!(text.contains("0x06000002"));
        assert!(text.contains("B7"));
        assert!(text.contains("unresolved value"));
    }
}
