//! Events surfaced upward to external observers.
//!
//! Each event carries a typed [`EventKind`] tag and an opaque JSON payload.

use serde::{Deserialize, Serialize};

use crate::clock::epoch_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    GroupLeaderJoined,
    GroupLeaderFailed,
    GroupManagerJoined,
    GroupManagerFailed,
    LocalControllerJoined,
    LocalControllerFailed,
    Start,
    Suspend,
    Resume,
    Shutdown,
    Reboot,
    Destroy,
    Resize,
    Destroyed,
    Migrate,
    Migrated,
    Summary,
    Anomaly,
    Reconfiguration,
}

/// Coarse grouping of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Hierarchy,
    VirtualMachine,
    System,
}

impl EventKind {
    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::GroupLeaderJoined
            | EventKind::GroupLeaderFailed
            | EventKind::GroupManagerJoined
            | EventKind::GroupManagerFailed
            | EventKind::LocalControllerJoined
            | EventKind::LocalControllerFailed => EventCategory::Hierarchy,
            EventKind::Summary | EventKind::Anomaly | EventKind::Reconfiguration => {
                EventCategory::System
            }
            _ => EventCategory::VirtualMachine,
        }
    }
}

/// A single event emitted by a control-plane component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// Id of the component that emitted the event.
    pub source: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub payload: serde_json::Value,
}

impl Event {
    /// Build an event; a payload that fails to serialize becomes `null`.
    pub fn new(kind: EventKind, source: &str, payload: impl Serialize) -> Self {
        Self {
            kind,
            source: source.to_string(),
            timestamp: epoch_millis(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }
}
