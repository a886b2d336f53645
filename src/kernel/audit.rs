//! Bounded audit log for fact-store activity.
//!
//! Every assert, retract, rejection, and gate refusal appends a typed event
//! so policy decisions can be reconstructed after the fact. The log is a
//! fixed-capacity ring: old events fall off, the kernel never grows
//! unboundedly on its own bookkeeping.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::datalog::Origin;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Fact inserted into the EDB
    Assert,
    /// Facts removed from the EDB
    Retract,
    /// Schema text loaded
    SchemaLoad,
    /// Evaluation completed
    Evaluate,
    /// Evaluation aborted (gas, validation)
    EvaluateFailed,
    /// Rule rejected by the validator
    RuleRejected,
    /// Fact rejected by the validator
    FactRejected,
    /// Control-channel update dropped by the constitutional filter
    ControlUpdateDropped,
    /// Write-class action refused by the gate
    GateRefusal,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event kind
    pub kind: AuditKind,
    /// Predicate involved, when applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    /// Origin of the triggering fact or update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    /// Human-readable detail
    pub detail: String,
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Create an event stamped now.
    pub fn new(kind: AuditKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            predicate: None,
            origin: None,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the predicate.
    pub fn with_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    /// Attach the origin.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// Fixed-capacity ring of audit events.
#[derive(Debug)]
pub struct AuditLog {
    events: VecDeque<AuditEvent>,
    capacity: usize,
}

impl AuditLog {
    /// Create a log holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Append an event, evicting the oldest when full.
    pub fn push(&mut self, event: AuditEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Events oldest-first.
    pub fn events(&self) -> impl Iterator<Item = &AuditEvent> {
        self.events.iter()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Export the retained events as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!(self.events.iter().collect::<Vec<_>>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_eviction() {
        let mut log = AuditLog::new(2);
        log.push(AuditEvent::new(AuditKind::Assert, "a"));
        log.push(AuditEvent::new(AuditKind::Assert, "b"));
        log.push(AuditEvent::new(AuditKind::Assert, "c"));
        let details: Vec<_> = log.events().map(|e| e.detail.as_str()).collect();
        assert_eq!(details, vec!["b", "c"]);
    }

    #[test]
    fn test_event_builder() {
        let e = AuditEvent::new(AuditKind::GateRefusal, "write_file blocked")
            .with_predicate("write_file")
            .with_origin(Origin::System);
        assert_eq!(e.predicate.as_deref(), Some("write_file"));
        assert_eq!(e.origin, Some(Origin::System));
    }
}
