//! Structured trail of the transformations passes perform.
//!
//! The log is append-only and lock-free (`boxcar::Vec`), so per-method closures running
//! on the rayon pool can record into a shared log without synchronisation. Events are
//! built fluently and committed when the builder is dropped:
//!
//! ```rust
//! use dexopt::compiler::{EventKind, EventLog};
//!
//! let log = EventLog::new();
//! log.record(EventKind::InstructionRemoved).message("dead const");
//! assert_eq!(log.count(EventKind::InstructionRemoved), 1);
//! ```

use std::fmt;

use strum::{Display, EnumIter};

use crate::pool::DexMethodRef;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum EventKind {
    /// An instruction was deleted.
    InstructionRemoved,
    /// An instruction sequence was rewritten into a cheaper one.
    InstructionReplaced,
    /// A `check-cast` was proven redundant.
    CastRemoved,
    /// A builder chain was folded into a constant string.
    StringFolded,
    /// A call site was replaced by the callee's body.
    MethodInlined,
    /// The inliner declined a call site.
    InlineRefused,
    /// A member was made public so inlined code can reach it.
    MemberOpened,
    /// A method body was wrapped or patched.
    MethodPatched,
    /// A write barrier call was inserted.
    BarrierAdded,
    /// A method's registers were reallocated.
    RegistersAllocated,
    /// The interdex packer closed a dex.
    DexClosed,
    /// Two dexes were merged.
    DexRemoved,
    /// Informational note.
    Info,
    /// Something looked wrong but was tolerated.
    Warning,
}

/// One recorded transformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// The method it happened in.
    pub method: Option<DexMethodRef>,
    /// Instruction index inside the method, when meaningful.
    pub index: Option<usize>,
    /// Free-form detail.
    pub message: Option<String>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind)?;
        if let Some(m) = &self.method {
            write!(f, " {m}")?;
        }
        if let Some(i) = self.index {
            write!(f, " @{i}")?;
        }
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

/// Append-only event log shared by all passes of a run.
#[derive(Debug, Default)]
pub struct EventLog {
    events: boxcar::Vec<Event>,
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts recording an event; it is committed when the returned builder drops.
    pub fn record(&self, kind: EventKind) -> EventBuilder<'_> {
        EventBuilder {
            log: self,
            event: Some(Event {
                kind,
                method: None,
                index: None,
                message: None,
            }),
        }
    }

    /// Records an [`EventKind::Info`] note.
    pub fn info(&self, message: impl Into<String>) {
        self.record(EventKind::Info).message(message);
    }

    /// Records an [`EventKind::Warning`].
    pub fn warn(&self, message: impl Into<String>) {
        self.record(EventKind::Warning).message(message);
    }

    /// Moves every event of `other` into this log.
    pub fn merge(&self, other: EventLog) {
        for event in other.events {
            self.events.push(event);
        }
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.count()
    }

    /// `true` if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events in recording order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(|(_, e)| e)
    }

    /// Number of events of `kind`.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.iter().filter(|e| e.kind == kind).count()
    }

    /// Events recorded for `method`.
    pub fn for_method<'a>(&'a self, method: &'a DexMethodRef) -> impl Iterator<Item = &'a Event> {
        self.iter().filter(move |e| e.method.as_ref() == Some(method))
    }
}

/// Fluent builder returned by [`EventLog::record`]; the event is committed on drop.
pub struct EventBuilder<'a> {
    log: &'a EventLog,
    event: Option<Event>,
}

impl EventBuilder<'_> {
    /// Attaches the method.
    pub fn method(mut self, method: &DexMethodRef) -> Self {
        if let Some(e) = &mut self.event {
            e.method = Some(method.clone());
        }
        self
    }

    /// Attaches the method and an instruction index.
    pub fn at(mut self, method: &DexMethodRef, index: usize) -> Self {
        if let Some(e) = &mut self.event {
            e.method = Some(method.clone());
            e.index = Some(index);
        }
        self
    }

    /// Attaches a message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        if let Some(e) = &mut self.event {
            e.message = Some(message.into());
        }
        self
    }
}

impl Drop for EventBuilder<'_> {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            self.log.events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_merge() {
        let log = EventLog::new();
        let m = DexMethodRef::parse("LFoo;.bar:()V").unwrap();
        log.record(EventKind::CastRemoved).at(&m, 3).message("v0");
        let other = EventLog::new();
        other.warn("odd");
        log.merge(other);

        assert_eq!(log.len(), 2);
        assert_eq!(log.for_method(&m).count(), 1);
        let first = log.iter().next().unwrap();
        assert_eq!(first.index, Some(3));
        assert!(first.to_string().contains("CastRemoved"));
        assert_eq!(log.count(EventKind::Warning), 1);
    }
}
