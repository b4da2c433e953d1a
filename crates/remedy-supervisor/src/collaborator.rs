//! Interfaces to the external collaborators.
//!
//! The pipeline never talks to the reasoning service, the cluster API or
//! the watcher directly; it goes through these traits so each stage can
//! be driven by a deterministic stub in tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use remedy_core::events::{StatusEvent, StatusPayload};
use remedy_core::types::{
    Action, ActionRecord, CorrelationContext, CorrelationId, Diagnosis, ImpactLevel,
    ObservedState, TargetRef, TaskKey, TaskStatus,
};
use remedy_core::{ObserveError, ReasoningError, SafetyConfig, TargetError};

// ── Reasoning ─────────────────────────────────────────────────────

/// Evidence that started a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerEvidence {
    pub reason: String,
    pub observed: ObservedState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub correlation_id: CorrelationId,
    pub task: TaskKey,
    pub target: TargetRef,
    pub evidence: TriggerEvidence,
    pub recent_history: Vec<ActionRecord>,
    /// Lets the service pre-filter proposals by impact.
    pub safety: SafetyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationRequest {
    pub correlation_id: CorrelationId,
    pub task: TaskKey,
    pub target: TargetRef,
    pub diagnosis: Diagnosis,
    pub safety: SafetyConfig,
}

/// A candidate action as proposed by the reasoning service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedAction {
    pub action_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub impact: ImpactLevel,
    /// Defaults to the Task target when absent.
    #[serde(default)]
    pub target: Option<TargetRef>,
}

impl ProposedAction {
    pub fn into_action(self, default_target: &TargetRef) -> Action {
        Action {
            action_type: self.action_type,
            target: self.target.unwrap_or_else(|| default_target.clone()),
            parameters: self.parameters,
            impact: self.impact,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub rationale: String,
    pub confidence: f64,
    #[serde(default)]
    pub actions: Vec<ProposedAction>,
}

/// The opaque decision-producing collaborator.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Diagnosis, ReasoningError>;

    async fn recommend(
        &self,
        request: &RecommendationRequest,
    ) -> Result<Recommendation, ReasoningError>;
}

// ── Execution ─────────────────────────────────────────────────────

/// Successful application of one action.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppliedAction {
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

/// The system actions are applied to (e.g. a cluster API).
#[async_trait]
pub trait TargetSystem: Send + Sync {
    async fn apply(
        &self,
        action: &Action,
        correlation: &CorrelationContext,
    ) -> Result<AppliedAction, TargetError>;
}

// ── Observation ───────────────────────────────────────────────────

/// Delivers current target state and recent events.
#[async_trait]
pub trait ObservedStateSource: Send + Sync {
    async fn observe(&self, target: &TargetRef) -> Result<ObservedState, ObserveError>;
}

// ── Status ────────────────────────────────────────────────────────

/// Read projection of reconciler state for external status reporting.
pub trait StatusSink: Send + Sync {
    fn publish(&self, event: &StatusEvent, status: &TaskStatus);
}

/// Writes status changes to the structured log.
#[derive(Debug, Default)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn publish(&self, event: &StatusEvent, status: &TaskStatus) {
        match &event.payload {
            StatusPayload::PhaseChanged { from, to } => tracing::debug!(
                task = %event.task,
                from = %from,
                to = %to,
                "Phase changed"
            ),
            StatusPayload::TriggerCoalesced { reason } => tracing::info!(
                task = %event.task,
                reason = %reason,
                "Trigger coalesced"
            ),
            StatusPayload::CycleFinished {
                phase,
                record_count,
                requeue_after_ms,
            } => tracing::info!(
                task = %event.task,
                correlation_id = ?event.correlation_id,
                phase = %phase,
                record_count,
                requeue_after_ms,
                history_len = status.history.len(),
                "Cycle finished"
            ),
            StatusPayload::Retired => tracing::info!(task = %event.task, "Task retired"),
        }
    }
}

const DEFAULT_EVENT_CAP: usize = 1024;

/// Keeps the latest status of every Task in memory, plus a bounded tail
/// of recent events.
#[derive(Debug)]
pub struct StatusBoard {
    latest: Mutex<HashMap<TaskKey, TaskStatus>>,
    events: Mutex<VecDeque<StatusEvent>>,
    event_cap: usize,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::with_event_cap(DEFAULT_EVENT_CAP)
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `event_cap` events; the oldest are evicted first.
    pub fn with_event_cap(event_cap: usize) -> Self {
        Self {
            latest: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            event_cap: event_cap.max(1),
        }
    }

    pub fn get(&self, key: &TaskKey) -> Option<TaskStatus> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl StatusSink for StatusBoard {
    fn publish(&self, event: &StatusEvent, status: &TaskStatus) {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(status.key.clone(), status.clone());
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        while events.len() >= self.event_cap {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remedy_core::types::{Task, TaskSpec};

    #[test]
    fn proposed_action_defaults_to_task_target() {
        let target = TargetRef::namespaced("Deployment", "shop", "checkout");
        let proposed: ProposedAction =
            serde_json::from_str(r#"{"action_type":"restart","impact":"low"}"#).unwrap();
        let action = proposed.into_action(&target);
        assert_eq!(action.target, target);
        assert!(action.parameters.is_empty());
    }

    #[test]
    fn status_board_keeps_a_bounded_tail() {
        let board = StatusBoard::with_event_cap(2);
        let spec = TaskSpec {
            key: TaskKey::new("shop", "checkout-health"),
            target: TargetRef::namespaced("Deployment", "shop", "checkout"),
            conditions: vec![],
            safety: SafetyConfig::default(),
        };
        let status = Task::new(spec, 10).status();

        for reason in ["first", "second", "third"] {
            board.publish(
                &StatusEvent::new(
                    status.key.clone(),
                    None,
                    StatusPayload::TriggerCoalesced {
                        reason: reason.to_string(),
                    },
                ),
                &status,
            );
        }

        let reasons: Vec<_> = board
            .events()
            .into_iter()
            .map(|e| match e.payload {
                StatusPayload::TriggerCoalesced { reason } => reason,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(reasons, vec!["second", "third"]);
        assert!(board.get(&status.key).is_some());
    }
}
