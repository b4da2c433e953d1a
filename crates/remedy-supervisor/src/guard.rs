//! Safety guard: the single verdict every candidate action must pass.
//!
//! Checks run in a fixed order and the first failure wins:
//! allow-list → mode → impact → per-cycle cap → rate limit → idempotency.
//! Static checks come first so actions that are rejected anyway never
//! touch the shared limiter or ledger. The idempotency reservation is the
//! final step and is recorded atomically with the `Approved` verdict.

use std::sync::Arc;

use tokio::time::Instant;

use remedy_core::types::{
    Action, CorrelationContext, GuardReason, GuardVerdict, GuardedAction, ImpactLevel, TaskSpec,
};
use remedy_core::{OperatingMode, RateLimitConfig, SafetyConfig};

use crate::ledger::{EntryState, IdempotencyLedger, Reservation};
use crate::limiter::{RateDecision, RateKey, RateLimiter};

pub struct SafetyGuard {
    limiter: Arc<RateLimiter>,
    ledger: Arc<IdempotencyLedger>,
    default_rate_limit: RateLimitConfig,
}

impl SafetyGuard {
    pub fn new(
        limiter: Arc<RateLimiter>,
        ledger: Arc<IdempotencyLedger>,
        default_rate_limit: RateLimitConfig,
    ) -> Self {
        Self {
            limiter,
            ledger,
            default_rate_limit,
        }
    }

    pub fn ledger(&self) -> &Arc<IdempotencyLedger> {
        &self.ledger
    }

    fn rate_limit_for(&self, safety: &SafetyConfig) -> RateLimitConfig {
        safety.rate_limit.unwrap_or(self.default_rate_limit)
    }

    /// Verdict for a single action evaluated on its own.
    pub fn evaluate(
        &self,
        action: &Action,
        spec: &TaskSpec,
        correlation: &CorrelationContext,
    ) -> GuardVerdict {
        self.check(action, spec, correlation, 0, Instant::now())
    }

    /// Verdicts for a cycle's candidates, in order, applying the per-cycle cap.
    pub fn evaluate_all(
        &self,
        actions: Vec<Action>,
        spec: &TaskSpec,
        correlation: &CorrelationContext,
    ) -> Vec<GuardedAction> {
        let now = Instant::now();
        let mut approved = 0;
        actions
            .into_iter()
            .map(|action| {
                let verdict = self.check(&action, spec, correlation, approved, now);
                if verdict.allowed {
                    approved += 1;
                }
                tracing::debug!(
                    action_type = %action.action_type,
                    reason = ?verdict.reason,
                    "Guard verdict"
                );
                GuardedAction { action, verdict }
            })
            .collect()
    }

    fn check(
        &self,
        action: &Action,
        spec: &TaskSpec,
        correlation: &CorrelationContext,
        approved_in_cycle: usize,
        now: Instant,
    ) -> GuardVerdict {
        let safety = &spec.safety;

        if !safety.allows_type(&action.action_type) {
            return GuardVerdict::rejected(
                GuardReason::NotAllowlisted,
                format!("action type '{}' is not allow-listed", action.action_type),
            );
        }

        if safety.mode == OperatingMode::DryRun {
            let mut verdict = GuardVerdict::rejected(GuardReason::ModeBlocked, "dry-run mode");
            verdict.would_have = Some(self.preview(action, safety, approved_in_cycle, now));
            return verdict;
        }

        if let Some(verdict) = static_gate(action, safety, approved_in_cycle) {
            return verdict;
        }

        let limit = self.rate_limit_for(safety);
        let key = RateKey::for_action(action);
        if let RateDecision::Limited { retry_after } = self.limiter.try_acquire(&key, &limit, now)
        {
            return GuardVerdict::rejected(
                GuardReason::RateLimited,
                format!(
                    "more than {} '{}' actions within {}s",
                    limit.max_actions, action.action_type, limit.window_secs
                ),
            )
            .with_backoff_ms(duration_ms(retry_after));
        }

        match self
            .ledger
            .try_reserve(&action.fingerprint(), correlation.correlation_id, now)
        {
            Reservation::Reserved => GuardVerdict::approved(),
            Reservation::DuplicateInFlight { holder } => {
                self.limiter.release(&key, &limit, now);
                GuardVerdict::rejected(
                    GuardReason::DuplicateInFlight,
                    format!("already in flight in cycle {holder}"),
                )
            }
            Reservation::AlreadyCompleted { by } => {
                self.limiter.release(&key, &limit, now);
                GuardVerdict::rejected(
                    GuardReason::AlreadyCompleted,
                    format!("already completed by cycle {by}"),
                )
            }
        }
    }

    /// What the post-mode checks would conclude, without side effects.
    fn preview(
        &self,
        action: &Action,
        safety: &SafetyConfig,
        approved_in_cycle: usize,
        now: Instant,
    ) -> GuardReason {
        if let Some(verdict) = static_gate(action, safety, approved_in_cycle) {
            return verdict.reason;
        }
        let limit = self.rate_limit_for(safety);
        if let RateDecision::Limited { .. } =
            self.limiter.peek(&RateKey::for_action(action), &limit, now)
        {
            return GuardReason::RateLimited;
        }
        match self.ledger.peek(&action.fingerprint(), now) {
            Some(EntryState::InFlight) => GuardReason::DuplicateInFlight,
            Some(EntryState::Completed) => GuardReason::AlreadyCompleted,
            Some(EntryState::Failed) | None => GuardReason::Approved,
        }
    }

    /// Return the ledger reservation and rate budget of an approved action
    /// that will not be executed.
    pub fn release(&self, guarded: &GuardedAction, spec: &TaskSpec, correlation: &CorrelationContext) {
        if !guarded.verdict.allowed {
            return;
        }
        let action = &guarded.action;
        if self
            .ledger
            .release(&action.fingerprint(), correlation.correlation_id)
        {
            let limit = self.rate_limit_for(&spec.safety);
            self.limiter
                .release(&RateKey::for_action(action), &limit, Instant::now());
        }
    }
}

/// Impact gate and per-cycle cap. Pure over the action and config.
fn static_gate(
    action: &Action,
    safety: &SafetyConfig,
    approved_in_cycle: usize,
) -> Option<GuardVerdict> {
    if action.impact == ImpactLevel::High && !safety.allow_high_impact {
        return Some(GuardVerdict::rejected(
            GuardReason::ModeBlocked,
            "high-impact actions are not permitted",
        ));
    }
    if approved_in_cycle >= safety.max_concurrency {
        return Some(GuardVerdict::rejected(
            GuardReason::RateLimited,
            format!(
                "cycle already approved {} actions (max {})",
                approved_in_cycle, safety.max_concurrency
            ),
        ));
    }
    None
}

fn duration_ms(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
