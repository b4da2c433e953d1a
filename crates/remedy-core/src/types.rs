//! Core domain types for the Remedy remediation pipeline.
//!
//! These types describe supervised targets, the conditions that start a
//! remediation cycle, the actions a cycle may take, and the records it
//! leaves behind. They are shared by every pipeline stage and by the
//! external collaborators (reasoning service, target system, watcher).

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SafetyConfig;

// ── Identity ──────────────────────────────────────────────────────

/// Identity of a supervision request (namespace/name).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub namespace: String,
    pub name: String,
}

impl TaskKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `namespace/name` string.
    pub fn parse(raw: &str) -> Option<Self> {
        let (namespace, name) = raw.split_once('/')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The cluster object a Task supervises.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetRef {
    /// Object kind, e.g. `Deployment`.
    pub kind: String,
    pub name: String,
    /// Optional scope; `None` for cluster-scoped objects.
    #[serde(default)]
    pub namespace: Option<String>,
}

impl TargetRef {
    pub fn namespaced(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Identifier threaded through one trigger-to-completion cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable context carried by value through every stage of one cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrelationContext {
    pub correlation_id: CorrelationId,
    pub task: TaskKey,
    pub started_at: DateTime<Utc>,
    /// Target snapshot taken when the cycle started.
    pub target: TargetRef,
}

// ── Trigger conditions & observed state ───────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    pub fn holds(self, observed: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => observed > threshold,
            Self::Gte => observed >= threshold,
            Self::Lt => observed < threshold,
            Self::Lte => observed <= threshold,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        };
        f.write_str(op)
    }
}

/// A predicate over observed state that may start a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// A metric crosses a threshold.
    Metric {
        metric: String,
        comparator: Comparator,
        threshold: f64,
    },
    /// Matching events occurred at least `min_count` times in the window.
    Event {
        /// Event type filter, e.g. `Warning`. Matches any type when absent.
        #[serde(default)]
        event_type: Option<String>,
        /// Substring matched against the event reason, e.g. `FailedMount`.
        reason: String,
        #[serde(default = "default_min_count")]
        min_count: u32,
        #[serde(default = "default_window_secs")]
        window_secs: u64,
    },
}

fn default_min_count() -> u32 {
    1
}

fn default_window_secs() -> u64 {
    600
}

/// A watcher-reported event about a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedEvent {
    pub event_type: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "default_min_count")]
    pub count: u32,
    pub last_seen: DateTime<Utc>,
}

/// Current state of a target as delivered by the observed-state feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedState {
    pub target: TargetRef,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub events: Vec<ObservedEvent>,
    pub observed_at: DateTime<Utc>,
}

// ── Actions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
}

/// Deterministic hex digest of an action's (type, target, parameters).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed, parameterized corrective instruction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub action_type: String,
    pub target: TargetRef,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub impact: ImpactLevel,
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    action_type: &'a str,
    target: &'a TargetRef,
    parameters: &'a BTreeMap<String, serde_json::Value>,
}

impl Action {
    pub fn new(action_type: impl Into<String>, target: TargetRef, impact: ImpactLevel) -> Self {
        Self {
            action_type: action_type.into(),
            target,
            parameters: BTreeMap::new(),
            impact,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// BLAKE3 over canonical JSON of (type, target, parameters).
    ///
    /// Parameters live in ordered maps, so insertion order never changes
    /// the digest. Impact is deliberately excluded.
    pub fn fingerprint(&self) -> Fingerprint {
        let input = FingerprintInput {
            action_type: &self.action_type,
            target: &self.target,
            parameters: &self.parameters,
        };
        // Serializing string-keyed maps and plain structs cannot fail.
        let bytes = serde_json::to_vec(&input).unwrap_or_default();
        Fingerprint(blake3::hash(&bytes).to_hex().to_string())
    }
}

// ── Guard verdicts & decisions ────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GuardReason {
    NotAllowlisted,
    ModeBlocked,
    RateLimited,
    DuplicateInFlight,
    AlreadyCompleted,
    Approved,
}

/// Per-action result of the safety guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardVerdict {
    pub allowed: bool,
    pub reason: GuardReason,
    /// Suggested wait before retrying, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// In dry-run mode: what the remaining checks would have produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub would_have: Option<GuardReason>,
}

impl GuardVerdict {
    pub fn approved() -> Self {
        Self {
            allowed: true,
            reason: GuardReason::Approved,
            backoff_ms: None,
            detail: None,
            would_have: None,
        }
    }

    pub fn rejected(reason: GuardReason, detail: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason,
            backoff_ms: None,
            detail: Some(detail.into()),
            would_have: None,
        }
    }

    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = Some(backoff_ms);
        self
    }
}

/// A candidate action paired with the guard's verdict on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardedAction {
    pub action: Action,
    pub verdict: GuardVerdict,
}

/// Structured diagnosis produced by the reasoning collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnosis {
    pub summary: String,
    #[serde(default)]
    pub confidence: f64,
    /// Opaque, serializable evidence.
    #[serde(default)]
    pub evidence: serde_json::Value,
}

/// Final gate outcome of a decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approve,
    Reject,
    HumanReview,
    Simulated,
}

/// Output of one orchestration cycle. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub correlation_id: CorrelationId,
    pub approved: bool,
    pub outcome: ApprovalOutcome,
    /// Every candidate in proposal order, including rejected ones.
    pub actions: Vec<GuardedAction>,
    #[serde(default)]
    pub diagnosis: Option<Diagnosis>,
    pub rationale: String,
    pub confidence: f64,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    /// Candidates the guard approved, in order.
    pub fn survivors(&self) -> impl Iterator<Item = &GuardedAction> {
        self.actions.iter().filter(|ga| ga.verdict.allowed)
    }

    /// Whether the cycle should move on to execution.
    pub fn is_executable(&self) -> bool {
        self.approved && self.survivors().next().is_some()
    }
}

// ── Records ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Append-only history entry for one candidate action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    pub correlation_id: CorrelationId,
    pub action: Action,
    pub verdict: GuardVerdict,
    pub outcome: ExecutionOutcome,
    #[serde(default)]
    pub error: Option<String>,
    /// Structured detail reported by the target system.
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ActionRecord {
    /// Record for a candidate that was never attempted.
    pub fn skipped(
        correlation_id: CorrelationId,
        guarded: &GuardedAction,
        reason: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            action: guarded.action.clone(),
            verdict: guarded.verdict.clone(),
            outcome: ExecutionOutcome::Skipped,
            error: reason,
            detail: None,
            attempts: 0,
            started_at: now,
            finished_at: now,
        }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────

/// Lifecycle phase of a Task.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Evaluating,
    Deciding,
    Executing,
    Completed,
    Error,
    Retired,
}

impl Phase {
    /// True while a cycle owns the Task.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Evaluating | Self::Deciding | Self::Executing)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Evaluating => "evaluating",
            Self::Deciding => "deciding",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Retired => "retired",
        };
        f.write_str(name)
    }
}

/// A declared supervision request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub key: TaskKey,
    pub target: TargetRef,
    #[serde(default)]
    pub conditions: Vec<TriggerCondition>,
    #[serde(default)]
    pub safety: SafetyConfig,
}

/// Ongoing supervision over one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub spec: TaskSpec,
    /// Bumped whenever the spec is replaced.
    pub generation: u64,
    pub phase: Phase,
    pub last_triggered: Option<DateTime<Utc>>,
    pub last_correlation_id: Option<CorrelationId>,
    pub last_error: Option<String>,
    pub consecutive_errors: u32,
    pub history: VecDeque<ActionRecord>,
    pub history_cap: usize,
}

impl Task {
    pub fn new(spec: TaskSpec, history_cap: usize) -> Self {
        Self {
            spec,
            generation: 1,
            phase: Phase::Idle,
            last_triggered: None,
            last_correlation_id: None,
            last_error: None,
            consecutive_errors: 0,
            history: VecDeque::new(),
            history_cap: history_cap.max(1),
        }
    }

    pub fn key(&self) -> &TaskKey {
        &self.spec.key
    }

    /// Replace the whole spec (conditions included) and start a new generation.
    pub fn replace_spec(&mut self, spec: TaskSpec) {
        self.spec = spec;
        self.generation += 1;
    }

    /// Append records in order, evicting the oldest beyond the cap.
    pub fn append_records(&mut self, records: impl IntoIterator<Item = ActionRecord>) {
        for record in records {
            self.history.push_back(record);
            while self.history.len() > self.history_cap {
                self.history.pop_front();
            }
        }
    }

    /// The most recent `n` records, oldest first.
    pub fn recent_history(&self, n: usize) -> Vec<ActionRecord> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// Read projection for status reporting.
    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            key: self.spec.key.clone(),
            target: self.spec.target.clone(),
            generation: self.generation,
            phase: self.phase,
            last_triggered: self.last_triggered,
            last_correlation_id: self.last_correlation_id,
            last_error: self.last_error.clone(),
            history: self.history.iter().cloned().collect(),
        }
    }
}

/// Externally visible projection of a Task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatus {
    pub key: TaskKey,
    pub target: TargetRef,
    pub generation: u64,
    pub phase: Phase,
    pub last_triggered: Option<DateTime<Utc>>,
    pub last_correlation_id: Option<CorrelationId>,
    pub last_error: Option<String>,
    pub history: Vec<ActionRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetRef {
        TargetRef::namespaced("Deployment", "shop", "checkout")
    }

    fn spec() -> TaskSpec {
        TaskSpec {
            key: TaskKey::new("shop", "checkout-health"),
            target: target(),
            conditions: vec![TriggerCondition::Metric {
                metric: "restarts".to_string(),
                comparator: Comparator::Gte,
                threshold: 3.0,
            }],
            safety: SafetyConfig::default(),
        }
    }

    fn record(n: u64) -> ActionRecord {
        let action = Action::new("restart", target(), ImpactLevel::Low)
            .with_parameter("n", serde_json::json!(n));
        ActionRecord::skipped(
            CorrelationId::new(),
            &GuardedAction {
                action,
                verdict: GuardVerdict::approved(),
            },
            None,
        )
    }

    #[test]
    fn fingerprint_ignores_parameter_insertion_order() {
        let a = Action::new("scale", target(), ImpactLevel::Medium)
            .with_parameter("replicas", serde_json::json!(3))
            .with_parameter("reason", serde_json::json!("load"));
        let b = Action::new("scale", target(), ImpactLevel::Medium)
            .with_parameter("reason", serde_json::json!("load"))
            .with_parameter("replicas", serde_json::json!(3));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_parameters_and_target() {
        let base = Action::new("scale", target(), ImpactLevel::Medium)
            .with_parameter("replicas", serde_json::json!(3));
        let other_params = base
            .clone()
            .with_parameter("replicas", serde_json::json!(4));
        let mut other_target = base.clone();
        other_target.target.name = "payments".to_string();

        assert_ne!(base.fingerprint(), other_params.fingerprint());
        assert_ne!(base.fingerprint(), other_target.fingerprint());
        assert_eq!(base.fingerprint().0.len(), 64);
    }

    #[test]
    fn fingerprint_excludes_impact() {
        let low = Action::new("restart", target(), ImpactLevel::Low);
        let high = Action::new("restart", target(), ImpactLevel::High);
        assert_eq!(low.fingerprint(), high.fingerprint());
    }

    #[test]
    fn history_evicts_oldest_beyond_cap() {
        let mut task = Task::new(spec(), 3);
        task.append_records((0..5).map(record));

        assert_eq!(task.history.len(), 3);
        let first = task.history.front().unwrap();
        assert_eq!(first.action.parameters["n"], serde_json::json!(2));
        assert_eq!(task.recent_history(2).len(), 2);
        assert_eq!(
            task.recent_history(2)[1].action.parameters["n"],
            serde_json::json!(4)
        );
    }

    #[test]
    fn replacing_spec_bumps_generation() {
        let mut task = Task::new(spec(), 10);
        let mut next = spec();
        next.conditions.clear();
        task.replace_spec(next);
        assert_eq!(task.generation, 2);
        assert!(task.spec.conditions.is_empty());
    }

    #[test]
    fn trigger_condition_tagged_serialization() {
        let json = r#"{"kind":"event","event_type":"Warning","reason":"FailedMount"}"#;
        let cond: TriggerCondition = serde_json::from_str(json).unwrap();
        assert_eq!(
            cond,
            TriggerCondition::Event {
                event_type: Some("Warning".to_string()),
                reason: "FailedMount".to_string(),
                min_count: 1,
                window_secs: 600,
            }
        );
    }

    #[test]
    fn guard_reason_serializes_snake_case() {
        let json = serde_json::to_string(&GuardReason::DuplicateInFlight).unwrap();
        assert_eq!(json, "\"duplicate_in_flight\"");
    }

    #[test]
    fn task_key_parse() {
        assert_eq!(
            TaskKey::parse("shop/checkout"),
            Some(TaskKey::new("shop", "checkout"))
        );
        assert_eq!(TaskKey::parse("checkout"), None);
        assert_eq!(TaskKey::parse("/checkout"), None);
    }

    #[test]
    fn in_flight_phases() {
        assert!(Phase::Evaluating.is_in_flight());
        assert!(Phase::Deciding.is_in_flight());
        assert!(Phase::Executing.is_in_flight());
        assert!(!Phase::Idle.is_in_flight());
        assert!(!Phase::Completed.is_in_flight());
        assert!(!Phase::Retired.is_in_flight());
    }
}
