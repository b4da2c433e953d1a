//! Action execution: sequential, fail-fast, retried in place.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use remedy_core::types::{
    ActionRecord, CorrelationContext, ExecutionOutcome, GuardedAction, TaskSpec,
};
use remedy_core::TargetError;

use crate::collaborator::{AppliedAction, TargetSystem};
use crate::config::PipelineSettings;
use crate::guard::SafetyGuard;
use crate::ledger::IdempotencyLedger;

/// Bounded exponential backoff for transient target failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: settings.retry_base_delay,
            max_delay: settings.retry_max_delay,
            attempt_timeout: settings.attempt_timeout,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Longest one approved action can hold its reservation once it starts:
    /// every attempt timing out, plus the backoff between attempts.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff = (1..attempts)
            .map(|n| self.delay_after(n))
            .fold(Duration::ZERO, Duration::saturating_add);
        self.attempt_timeout
            .saturating_mul(attempts)
            .saturating_add(backoff)
    }
}

/// Per-candidate progress reported while a batch runs.
#[derive(Debug, Clone, Copy)]
pub enum Progress<'a> {
    /// Attempt number `attempt` (1-based) of candidate `index` is starting.
    Attempt { index: usize, attempt: u32 },
    /// Candidate `index` has its final record.
    Recorded {
        index: usize,
        record: &'a ActionRecord,
    },
}

pub struct ActionExecutor {
    target: Arc<dyn TargetSystem>,
    guard: Arc<SafetyGuard>,
    policy: RetryPolicy,
}

impl ActionExecutor {
    pub fn new(target: Arc<dyn TargetSystem>, guard: Arc<SafetyGuard>, policy: RetryPolicy) -> Self {
        Self {
            target,
            guard,
            policy,
        }
    }

    fn ledger(&self) -> &IdempotencyLedger {
        self.guard.ledger()
    }

    /// Run the approved candidates in order and record every candidate.
    pub async fn execute(
        &self,
        actions: &[GuardedAction],
        spec: &TaskSpec,
        correlation: &CorrelationContext,
    ) -> Vec<ActionRecord> {
        self.execute_with(actions, spec, correlation, |_| {}).await
    }

    /// Like `execute`, reporting each attempt and record as it happens.
    ///
    /// Rejected candidates are recorded as `Skipped` with their verdict.
    /// After the first failure, remaining approved candidates are skipped
    /// and handed back to the guard.
    pub async fn execute_with<F>(
        &self,
        actions: &[GuardedAction],
        spec: &TaskSpec,
        correlation: &CorrelationContext,
        on_progress: F,
    ) -> Vec<ActionRecord>
    where
        F: Fn(Progress<'_>) + Send + Sync,
    {
        let mut records = Vec::with_capacity(actions.len());
        let mut failed = false;

        for (index, guarded) in actions.iter().enumerate() {
            let record = if !guarded.verdict.allowed {
                ActionRecord::skipped(
                    correlation.correlation_id,
                    guarded,
                    guarded.verdict.detail.clone(),
                )
            } else if failed {
                self.guard.release(guarded, spec, correlation);
                ActionRecord::skipped(
                    correlation.correlation_id,
                    guarded,
                    Some("aborted after an earlier action failed".to_string()),
                )
            } else {
                let record = self.run_one(index, guarded, correlation, &on_progress).await;
                failed = record.outcome == ExecutionOutcome::Failed;
                record
            };
            on_progress(Progress::Recorded {
                index,
                record: &record,
            });
            records.push(record);
        }

        records
    }

    async fn run_one<F>(
        &self,
        index: usize,
        guarded: &GuardedAction,
        correlation: &CorrelationContext,
        on_progress: &F,
    ) -> ActionRecord
    where
        F: Fn(Progress<'_>) + Send + Sync,
    {
        let action = &guarded.action;
        let fingerprint = action.fingerprint();
        let correlation_id = correlation.correlation_id;

        if !self.ledger().renew(&fingerprint, correlation_id, Instant::now()) {
            tracing::warn!(
                action_type = %action.action_type,
                fingerprint = %fingerprint.0,
                "Reservation no longer held, skipping action"
            );
            return ActionRecord::skipped(
                correlation_id,
                guarded,
                Some("idempotency reservation was taken over by another cycle".to_string()),
            );
        }

        let started_at = Utc::now();
        let max_attempts = self.policy.max_attempts.max(1);

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            on_progress(Progress::Attempt {
                index,
                attempt: attempts,
            });
            match self.attempt(guarded, correlation).await {
                Ok(applied) => break Ok(applied),
                Err(e) if e.is_transient() && attempts < max_attempts => {
                    let delay = self.policy.delay_after(attempts);
                    tracing::warn!(
                        action_type = %action.action_type,
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        let (outcome, error, detail) = match result {
            Ok(applied) => {
                if !self
                    .ledger()
                    .mark_completed(&fingerprint, correlation_id, Instant::now())
                {
                    tracing::warn!(
                        action_type = %action.action_type,
                        fingerprint = %fingerprint.0,
                        "Ledger entry no longer held by this cycle, completion not recorded"
                    );
                }
                tracing::info!(
                    action_type = %action.action_type,
                    target = %action.target,
                    attempts,
                    "Action applied"
                );
                (ExecutionOutcome::Succeeded, None, applied.detail)
            }
            Err(e) => {
                if !self
                    .ledger()
                    .mark_failed(&fingerprint, correlation_id, Instant::now())
                {
                    tracing::warn!(
                        action_type = %action.action_type,
                        fingerprint = %fingerprint.0,
                        "Ledger entry no longer held by this cycle, failure not recorded"
                    );
                }
                tracing::error!(
                    action_type = %action.action_type,
                    target = %action.target,
                    attempts,
                    error = %e,
                    "Action failed"
                );
                (ExecutionOutcome::Failed, Some(e.to_string()), None)
            }
        };

        ActionRecord {
            correlation_id,
            action: action.clone(),
            verdict: guarded.verdict.clone(),
            outcome,
            error,
            detail,
            attempts,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn attempt(
        &self,
        guarded: &GuardedAction,
        correlation: &CorrelationContext,
    ) -> Result<AppliedAction, TargetError> {
        let timeout = self.policy.attempt_timeout;
        match tokio::time::timeout(timeout, self.target.apply(&guarded.action, correlation)).await
        {
            Ok(result) => result,
            Err(_) => Err(TargetError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

/// Whether any record in a cycle failed.
pub fn cycle_failed(records: &[ActionRecord]) -> bool {
    records
        .iter()
        .any(|r| r.outcome == ExecutionOutcome::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use remedy_core::types::{
        Action, CorrelationId, GuardReason, GuardVerdict, ImpactLevel, TargetRef, TaskKey,
    };
    use remedy_core::{RateLimitConfig, SafetyConfig};

    use crate::ledger::{EntryState, Reservation};
    use crate::limiter::RateLimiter;

    #[derive(Clone, Copy)]
    enum Script {
        Succeed,
        Hang,
        /// Succeed after `secs` seconds.
        Slow(u64),
        FailTransientThenSucceed(u32),
        NotFound,
    }

    struct ScriptedTarget {
        scripts: HashMap<String, Script>,
        calls: Mutex<HashMap<String, u32>>,
        total: AtomicU32,
    }

    impl ScriptedTarget {
        fn new(scripts: &[(&str, Script)]) -> Self {
            Self {
                scripts: scripts
                    .iter()
                    .map(|(t, s)| (t.to_string(), *s))
                    .collect(),
                calls: Mutex::new(HashMap::new()),
                total: AtomicU32::new(0),
            }
        }

        fn calls(&self, action_type: &str) -> u32 {
            self.calls
                .lock()
                .unwrap()
                .get(action_type)
                .copied()
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl TargetSystem for ScriptedTarget {
        async fn apply(
            &self,
            action: &Action,
            _: &CorrelationContext,
        ) -> Result<AppliedAction, TargetError> {
            self.total.fetch_add(1, Ordering::SeqCst);
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(action.action_type.clone()).or_insert(0);
                *n += 1;
                *n
            };
            match self.scripts[&action.action_type] {
                Script::Succeed => Ok(AppliedAction {
                    detail: Some(serde_json::json!({"ok": true})),
                }),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(AppliedAction::default())
                }
                Script::Slow(secs) => {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    Ok(AppliedAction::default())
                }
                Script::FailTransientThenSucceed(failures) if call <= failures => {
                    Err(TargetError::Transient("503".to_string()))
                }
                Script::FailTransientThenSucceed(_) => Ok(AppliedAction::default()),
                Script::NotFound => Err(TargetError::NotFound("deployment gone".to_string())),
            }
        }
    }

    fn ctx() -> CorrelationContext {
        CorrelationContext {
            correlation_id: CorrelationId::new(),
            task: TaskKey::new("shop", "checkout-health"),
            started_at: Utc::now(),
            target: TargetRef::namespaced("Deployment", "shop", "checkout"),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(30),
        }
    }

    fn guard_with(in_flight_ttl: Duration, max_actions: u32) -> Arc<SafetyGuard> {
        Arc::new(SafetyGuard::new(
            Arc::new(RateLimiter::new()),
            Arc::new(IdempotencyLedger::new(Duration::from_secs(86_400), in_flight_ttl)),
            RateLimitConfig {
                window_secs: 300,
                max_actions,
            },
        ))
    }

    fn guard() -> Arc<SafetyGuard> {
        guard_with(Duration::from_secs(3600), 10)
    }

    fn spec(types: &[&str]) -> TaskSpec {
        let mut safety = SafetyConfig::enact(types.iter().copied());
        safety.max_concurrency = 10;
        TaskSpec {
            key: TaskKey::new("shop", "checkout-health"),
            target: TargetRef::namespaced("Deployment", "shop", "checkout"),
            conditions: vec![],
            safety,
        }
    }

    /// Approved candidates with their reservations taken, as the guard leaves them.
    fn approved(ledger: &IdempotencyLedger, ctx: &CorrelationContext, types: &[&str]) -> Vec<GuardedAction> {
        types
            .iter()
            .map(|t| {
                let action = Action::new(*t, ctx.target.clone(), ImpactLevel::Low);
                assert_eq!(
                    ledger.try_reserve(&action.fingerprint(), ctx.correlation_id, Instant::now()),
                    Reservation::Reserved
                );
                GuardedAction {
                    action,
                    verdict: GuardVerdict::approved(),
                }
            })
            .collect()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_after(1), Duration::from_millis(500));
        assert_eq!(p.delay_after(2), Duration::from_millis(1000));
        assert_eq!(p.delay_after(3), Duration::from_millis(2000));
        assert_eq!(p.delay_after(10), Duration::from_secs(10));
        assert_eq!(p.delay_after(64), Duration::from_secs(10));
        // 3 × 30s attempts + 0.5s + 1s of backoff.
        assert_eq!(p.worst_case(), Duration::from_millis(91_500));
    }

    #[tokio::test]
    async fn success_marks_ledger_completed() {
        let guard = guard();
        let ledger = guard.ledger().clone();
        let cycle = ctx();
        let actions = approved(&ledger, &cycle, &["restart"]);
        let target = Arc::new(ScriptedTarget::new(&[("restart", Script::Succeed)]));
        let executor = ActionExecutor::new(target.clone(), guard.clone(), policy());

        let records = executor.execute(&actions, &spec(&[]), &cycle).await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, ExecutionOutcome::Succeeded);
        assert_eq!(records[0].attempts, 1);
        assert_eq!(records[0].detail, Some(serde_json::json!({"ok": true})));
        assert_eq!(
            ledger.peek(&actions[0].action.fingerprint(), Instant::now()),
            Some(EntryState::Completed)
        );
        assert!(!cycle_failed(&records));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_in_place() {
        let guard = guard();
        let ledger = guard.ledger().clone();
        let cycle = ctx();
        let actions = approved(&ledger, &cycle, &["restart"]);
        let target = Arc::new(ScriptedTarget::new(&[(
            "restart",
            Script::FailTransientThenSucceed(2),
        )]));
        let executor = ActionExecutor::new(target.clone(), guard.clone(), policy());

        let records = executor.execute(&actions, &spec(&[]), &cycle).await;

        assert_eq!(records[0].outcome, ExecutionOutcome::Succeeded);
        assert_eq!(records[0].attempts, 3);
        assert_eq!(target.calls("restart"), 3);
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        let guard = guard();
        let ledger = guard.ledger().clone();
        let cycle = ctx();
        let actions = approved(&ledger, &cycle, &["restart"]);
        let target = Arc::new(ScriptedTarget::new(&[("restart", Script::NotFound)]));
        let executor = ActionExecutor::new(target.clone(), guard.clone(), policy());

        let records = executor.execute(&actions, &spec(&[]), &cycle).await;

        assert_eq!(records[0].outcome, ExecutionOutcome::Failed);
        assert_eq!(records[0].attempts, 1);
        assert!(records[0].error.as_deref().unwrap().contains("not found"));
        assert_eq!(
            ledger.peek(&actions[0].action.fingerprint(), Instant::now()),
            Some(EntryState::Failed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_exhausts_budget_then_fails_fast() {
        let guard = guard();
        let ledger = guard.ledger().clone();
        let cycle = ctx();
        let actions = approved(&ledger, &cycle, &["restart", "rollout", "annotate"]);
        let target = Arc::new(ScriptedTarget::new(&[
            ("restart", Script::Succeed),
            ("rollout", Script::Hang),
            ("annotate", Script::Succeed),
        ]));
        let executor = ActionExecutor::new(target.clone(), guard.clone(), policy());

        let records = executor.execute(&actions, &spec(&[]), &cycle).await;

        let outcomes: Vec<_> = records.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                ExecutionOutcome::Succeeded,
                ExecutionOutcome::Failed,
                ExecutionOutcome::Skipped
            ]
        );
        assert_eq!(records[1].attempts, 3);
        assert!(records[1].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(target.calls("annotate"), 0);
        assert_eq!(target.total.load(Ordering::SeqCst), 4);
        assert_eq!(
            ledger.peek(&actions[2].action.fingerprint(), Instant::now()),
            None
        );
        assert!(cycle_failed(&records));
    }

    #[tokio::test]
    async fn rejected_candidates_are_recorded_as_skipped() {
        let guard = guard();
        let ledger = guard.ledger().clone();
        let cycle = ctx();
        let mut actions = approved(&ledger, &cycle, &["restart"]);
        actions.push(GuardedAction {
            action: Action::new("scale-down", cycle.target.clone(), ImpactLevel::High),
            verdict: GuardVerdict::rejected(GuardReason::ModeBlocked, "high impact"),
        });
        let target = Arc::new(ScriptedTarget::new(&[("restart", Script::Succeed)]));
        let executor = ActionExecutor::new(target.clone(), guard.clone(), policy());

        let records = executor.execute(&actions, &spec(&[]), &cycle).await;

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].outcome, ExecutionOutcome::Skipped);
        assert_eq!(records[1].verdict.reason, GuardReason::ModeBlocked);
        assert_eq!(records[1].attempts, 0);
        assert_eq!(target.calls("scale-down"), 0);
    }

    #[tokio::test]
    async fn aborted_remainder_returns_rate_budget() {
        let guard = guard_with(Duration::from_secs(3600), 1);
        let spec = spec(&["restart", "rollout"]);
        let cycle = ctx();
        let actions = guard.evaluate_all(
            vec![
                Action::new("restart", cycle.target.clone(), ImpactLevel::Low),
                Action::new("rollout", cycle.target.clone(), ImpactLevel::Low),
            ],
            &spec,
            &cycle,
        );
        assert!(actions.iter().all(|a| a.verdict.allowed));
        let target = Arc::new(ScriptedTarget::new(&[
            ("restart", Script::NotFound),
            ("rollout", Script::Succeed),
        ]));
        let executor = ActionExecutor::new(target.clone(), guard.clone(), policy());

        let records = executor.execute(&actions, &spec, &cycle).await;

        assert_eq!(records[1].outcome, ExecutionOutcome::Skipped);
        assert_eq!(target.calls("rollout"), 0);
        // One `rollout` per window: the skipped action's slot came back.
        let retry = guard.evaluate(&actions[1].action, &spec, &ctx());
        assert!(retry.allowed, "{:?}", retry);
    }

    #[tokio::test]
    async fn lost_reservation_is_not_executed() {
        let guard = guard();
        let ledger = guard.ledger().clone();
        let cycle = ctx();
        let actions = approved(&ledger, &cycle, &["restart"]);
        let fingerprint = actions[0].action.fingerprint();
        let other = CorrelationId::new();
        assert!(ledger.release(&fingerprint, cycle.correlation_id));
        assert_eq!(
            ledger.try_reserve(&fingerprint, other, Instant::now()),
            Reservation::Reserved
        );
        let target = Arc::new(ScriptedTarget::new(&[("restart", Script::Succeed)]));
        let executor = ActionExecutor::new(target.clone(), guard.clone(), policy());

        let records = executor.execute(&actions, &spec(&[]), &cycle).await;

        assert_eq!(records[0].outcome, ExecutionOutcome::Skipped);
        assert!(records[0].error.as_deref().unwrap().contains("taken over"));
        assert_eq!(target.calls("restart"), 0);
        assert_eq!(
            ledger.peek(&fingerprint, Instant::now()),
            Some(EntryState::InFlight)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn completion_leaves_a_newer_reservation_alone() {
        let guard = guard_with(Duration::from_secs(2), 10);
        let ledger = guard.ledger().clone();
        let cycle = ctx();
        let actions = approved(&ledger, &cycle, &["restart"]);
        let fingerprint = actions[0].action.fingerprint();
        let target = Arc::new(ScriptedTarget::new(&[("restart", Script::Slow(5))]));
        let executor = ActionExecutor::new(target.clone(), guard.clone(), policy());
        let other = CorrelationId::new();

        let spec = spec(&[]);
        let (records, stolen) = tokio::join!(
            executor.execute(&actions, &spec, &cycle),
            async {
                tokio::time::sleep(Duration::from_secs(4)).await;
                ledger.try_reserve(&fingerprint, other, Instant::now())
            }
        );

        assert_eq!(stolen, Reservation::Reserved);
        assert_eq!(records[0].outcome, ExecutionOutcome::Succeeded);
        assert_eq!(
            ledger.peek(&fingerprint, Instant::now()),
            Some(EntryState::InFlight)
        );
        assert!(!ledger.release(&fingerprint, cycle.correlation_id));
        assert!(ledger.release(&fingerprint, other));
    }

    #[tokio::test]
    async fn progress_reports_attempts_and_records() {
        let guard = guard();
        let ledger = guard.ledger().clone();
        let cycle = ctx();
        let actions = approved(&ledger, &cycle, &["restart"]);
        let target = Arc::new(ScriptedTarget::new(&[("restart", Script::Succeed)]));
        let executor = ActionExecutor::new(target, guard.clone(), policy());
        let seen = Mutex::new(Vec::new());

        executor
            .execute_with(&actions, &spec(&[]), &cycle, |progress| {
                let entry = match progress {
                    Progress::Attempt { index, attempt } => format!("attempt {index}/{attempt}"),
                    Progress::Recorded { index, record } => {
                        format!("recorded {index} {:?}", record.outcome)
                    }
                };
                seen.lock().unwrap().push(entry);
            })
            .await;

        assert_eq!(
            seen.into_inner().unwrap(),
            vec!["attempt 0/1".to_string(), "recorded 0 Succeeded".to_string()]
        );
    }
}
