//! Status events published to the watcher's status sink.
//!
//! Events accompany a `TaskStatus` projection; they describe what just
//! happened to the Task, never how to change it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CorrelationId, Phase, TaskKey};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// An event emitted by a Task reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: EventId,
    pub task: TaskKey,
    pub correlation_id: Option<CorrelationId>,
    pub timestamp: DateTime<Utc>,
    pub payload: StatusPayload,
}

impl StatusEvent {
    pub fn new(
        task: TaskKey,
        correlation_id: Option<CorrelationId>,
        payload: StatusPayload,
    ) -> Self {
        Self {
            id: EventId::new(),
            task,
            correlation_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// The event payload, tagged by type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type")]
pub enum StatusPayload {
    /// The Task moved between phases.
    PhaseChanged { from: Phase, to: Phase },
    /// A trigger arrived while a cycle was in flight and was dropped.
    TriggerCoalesced { reason: String },
    /// A cycle reached `Completed` or `Error`.
    CycleFinished {
        phase: Phase,
        record_count: u32,
        requeue_after_ms: u64,
    },
    /// The supervision request was withdrawn.
    Retired,
}
