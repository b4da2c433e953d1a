//! Task state reconciler.
//!
//! Owns one Task. A cycle claims the Task under its lock (Idle →
//! Evaluating), then observes, evaluates, decides and executes without
//! holding the lock. Only `transition` changes the phase, and only this
//! module mutates the Task.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::Instrument;

use remedy_core::events::{StatusEvent, StatusPayload};
use remedy_core::types::{
    ActionRecord, CorrelationContext, CorrelationId, Decision, ExecutionOutcome, Phase, Task,
    TaskSpec, TaskStatus,
};
use remedy_core::ObserveError;
use remedy_journal::recorder::JournalRecorder;
use remedy_journal::store::{FileJournalStore, JournalStore};

use crate::collaborator::{
    ObservedStateSource, ReasoningEngine, StatusSink, TargetSystem, TriggerEvidence,
};
use crate::config::PipelineSettings;
use crate::error::{Result, SupervisorError};
use crate::executor::{self, ActionExecutor, Progress, RetryPolicy};
use crate::guard::SafetyGuard;
use crate::ledger::IdempotencyLedger;
use crate::limiter::RateLimiter;
use crate::orchestrator::DecisionOrchestrator;
use crate::phase::{transition, Effect, InvalidTransition, PhaseEvent, RequeuePolicy};
use crate::{correlation, journal, trigger};

/// The external systems a pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub reasoning: Arc<dyn ReasoningEngine>,
    pub target: Arc<dyn TargetSystem>,
    pub observer: Arc<dyn ObservedStateSource>,
    pub sink: Arc<dyn StatusSink>,
}

/// Shared, stateless-per-Task pipeline components.
pub struct Pipeline {
    observer: Arc<dyn ObservedStateSource>,
    orchestrator: DecisionOrchestrator,
    executor: ActionExecutor,
    sink: Arc<dyn StatusSink>,
    journal: Option<Arc<dyn JournalStore + Send + Sync>>,
    requeue: RequeuePolicy,
    observe_timeout: Duration,
    history_cap: usize,
}

impl Pipeline {
    pub fn new(settings: &PipelineSettings, collaborators: Collaborators) -> Result<Self> {
        validate_settings(settings)?;
        let journal: Option<Arc<dyn JournalStore + Send + Sync>> = match &settings.journal_dir {
            Some(dir) => Some(Arc::new(FileJournalStore::new(dir)?)),
            None => None,
        };

        let ledger = Arc::new(IdempotencyLedger::new(
            settings.idempotency_retention,
            settings.in_flight_ttl,
        ));
        let guard = Arc::new(SafetyGuard::new(
            Arc::new(RateLimiter::new()),
            ledger.clone(),
            settings.rate_limit,
        ));

        Ok(Self {
            observer: collaborators.observer,
            orchestrator: DecisionOrchestrator::new(
                collaborators.reasoning,
                guard.clone(),
                settings.stage_timeout,
                settings.analysis_history,
            ),
            executor: ActionExecutor::new(
                collaborators.target,
                guard,
                RetryPolicy::from_settings(settings),
            ),
            sink: collaborators.sink,
            journal,
            requeue: RequeuePolicy::from_settings(settings),
            observe_timeout: settings.observe_timeout,
            history_cap: settings.history_cap,
        })
    }

    pub fn ledger(&self) -> &Arc<IdempotencyLedger> {
        self.orchestrator.guard().ledger()
    }

    pub fn requeue(&self) -> &RequeuePolicy {
        &self.requeue
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    fn journal_store(&self) -> Option<&dyn JournalStore> {
        self.journal
            .as_deref()
            .map(|store| store as &dyn JournalStore)
    }
}

fn validate_settings(settings: &PipelineSettings) -> Result<()> {
    if !settings.backoff_multiplier.is_finite() || settings.backoff_multiplier < 1.0 {
        return Err(SupervisorError::Config(format!(
            "error_backoff.multiplier must be a finite number >= 1, got {}",
            settings.backoff_multiplier
        )));
    }
    if settings.max_attempts == 0 {
        return Err(SupervisorError::Config(
            "retry.max_attempts must be at least 1".to_string(),
        ));
    }
    if settings.history_cap == 0 {
        return Err(SupervisorError::Config(
            "history_cap must be at least 1".to_string(),
        ));
    }
    // An InFlight entry that expires while its action still runs lets a
    // second cycle execute the same fingerprint.
    let worst_case = RetryPolicy::from_settings(settings).worst_case();
    if settings.in_flight_ttl <= worst_case {
        return Err(SupervisorError::Config(format!(
            "in_flight_ttl ({}s) must exceed the worst-case action time of {}s \
             (max_attempts x attempt_timeout plus retry backoff)",
            settings.in_flight_ttl.as_secs_f64(),
            worst_case.as_secs_f64()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle already owns the Task.
    Coalesced,
    /// The previous cycle's requeue delay has not elapsed.
    CoolingDown,
    Retired,
    Declined,
    EvaluationFailed,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Phase the Task is in once the call returns.
    pub phase: Phase,
    pub correlation_id: Option<CorrelationId>,
    /// `None` when the caller should not reschedule on its own.
    pub requeue_after: Option<Duration>,
    pub records: Vec<ActionRecord>,
}

impl CycleReport {
    fn idle(outcome: CycleOutcome, phase: Phase, requeue_after: Option<Duration>) -> Self {
        Self {
            outcome,
            phase,
            correlation_id: None,
            requeue_after,
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawOutcome {
    Retired,
    /// A cycle is in flight; the Task retires when it ends.
    Deferred,
    AlreadyRetired,
}

struct TaskState {
    task: Task,
    withdraw_pending: bool,
    rearm_at: Option<Instant>,
}

/// One supervised Task and its cycle discipline.
pub struct TaskRuntime {
    state: Mutex<TaskState>,
}

enum Claim {
    Ready {
        snapshot: Box<Task>,
        ctx: CorrelationContext,
    },
    Busy(CycleReport),
}

impl TaskRuntime {
    pub fn new(spec: TaskSpec, history_cap: usize) -> Self {
        Self {
            state: Mutex::new(TaskState {
                task: Task::new(spec, history_cap),
                withdraw_pending: false,
                rearm_at: None,
            }),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().task.status()
    }

    pub fn phase(&self) -> Phase {
        self.lock().task.phase
    }

    /// Replace the spec. A cycle in flight keeps the snapshot it started with.
    pub fn update_spec(&self, spec: TaskSpec) -> u64 {
        let mut state = self.lock();
        state.task.replace_spec(spec);
        tracing::info!(
            task = %state.task.key(),
            generation = state.task.generation,
            "Task spec replaced"
        );
        state.task.generation
    }

    pub fn withdraw(&self, pipeline: &Pipeline) -> WithdrawOutcome {
        self.with_state(pipeline, |state, events| {
            match state.task.phase {
                Phase::Retired => WithdrawOutcome::AlreadyRetired,
                phase if phase.is_in_flight() => {
                    state.withdraw_pending = true;
                    tracing::info!(task = %state.task.key(), "Withdrawal deferred until cycle ends");
                    WithdrawOutcome::Deferred
                }
                _ => match retire(state, events) {
                    Ok(()) => WithdrawOutcome::Retired,
                    Err(e) => {
                        tracing::error!(error = %e, "Withdrawal rejected");
                        WithdrawOutcome::Deferred
                    }
                },
            }
        })
    }

    /// Publish a dropped trigger if a cycle is in flight. Returns whether it was dropped.
    pub fn coalesce_if_busy(&self, pipeline: &Pipeline, reason: &str) -> bool {
        self.with_state(pipeline, |state, events| {
            if !state.task.phase.is_in_flight() {
                return false;
            }
            events.push(StatusEvent::new(
                state.task.key().clone(),
                state.task.last_correlation_id,
                StatusPayload::TriggerCoalesced {
                    reason: reason.to_string(),
                },
            ));
            true
        })
    }

    /// Run one cycle: claim, observe, evaluate, decide, execute, settle.
    ///
    /// If the returned future is dropped mid-cycle, the cycle's ledger
    /// reservations are rolled back and the Task moves to `Error`. Records
    /// of actions already applied are kept and the journal is stored.
    pub async fn run_cycle(&self, pipeline: &Pipeline) -> Result<CycleReport> {
        let (snapshot, ctx) = match self.claim(pipeline) {
            Claim::Ready { snapshot, ctx } => (snapshot, ctx),
            Claim::Busy(report) => return Ok(report),
        };

        let progress = CycleProgress::default();
        let span = correlation::cycle_span(&ctx);
        let mut guard = CycleGuard {
            runtime: self,
            pipeline,
            ctx: &ctx,
            spec: &snapshot.spec,
            progress: &progress,
            armed: true,
        };

        let result = self
            .drive(pipeline, &snapshot, &ctx, &progress)
            .instrument(span)
            .await;
        if result.is_ok() {
            guard.armed = false;
        }
        drop(guard);
        result
    }

    fn claim(&self, pipeline: &Pipeline) -> Claim {
        let now = Instant::now();
        self.with_state(pipeline, |state, events| {
            let key = state.task.key().clone();
            match state.task.phase {
                phase if phase.is_in_flight() => {
                    events.push(StatusEvent::new(
                        key,
                        state.task.last_correlation_id,
                        StatusPayload::TriggerCoalesced {
                            reason: format!("cycle already in flight (phase {phase})"),
                        },
                    ));
                    return Claim::Busy(CycleReport::idle(CycleOutcome::Coalesced, phase, None));
                }
                Phase::Retired => {
                    return Claim::Busy(CycleReport::idle(
                        CycleOutcome::Retired,
                        Phase::Retired,
                        None,
                    ))
                }
                Phase::Completed | Phase::Error => {
                    if let Some(rearm_at) = state.rearm_at.filter(|at| *at > now) {
                        return Claim::Busy(CycleReport::idle(
                            CycleOutcome::CoolingDown,
                            state.task.phase,
                            Some(rearm_at - now),
                        ));
                    }
                    if let Err(e) = advance(state, PhaseEvent::CooledDown, None, events) {
                        tracing::error!(error = %e, "Cool-down rejected");
                    }
                }
                Phase::Idle | Phase::Evaluating | Phase::Deciding | Phase::Executing => {}
            }

            let snapshot = Box::new(state.task.clone());
            let ctx = correlation::begin(&snapshot);
            match advance(state, PhaseEvent::Begin, Some(ctx.correlation_id), events) {
                Ok(_) => Claim::Ready { snapshot, ctx },
                Err(e) => {
                    tracing::error!(task = %key, error = %e, "Cycle could not start");
                    Claim::Busy(CycleReport::idle(
                        CycleOutcome::Coalesced,
                        state.task.phase,
                        None,
                    ))
                }
            }
        })
    }

    async fn drive(
        &self,
        pipeline: &Pipeline,
        snapshot: &Task,
        ctx: &CorrelationContext,
        progress: &CycleProgress,
    ) -> Result<CycleReport> {
        let evaluation = match self.observe(pipeline, ctx).await {
            Ok(observed) => trigger::should_trigger(snapshot, &observed)
                .map(|eval| (eval, observed))
                .map_err(SupervisorError::from),
            Err(e) => Err(e),
        };

        let (eval, observed) = match evaluation {
            Err(e) => {
                tracing::warn!(error = %e, "Trigger evaluation failed");
                return self.settle(
                    pipeline,
                    ctx,
                    PhaseEvent::EvaluationFailed,
                    Some(e.to_string()),
                    Vec::new(),
                    None,
                );
            }
            Ok((eval, _)) if !eval.fire => {
                tracing::debug!(reason = %eval.reason, "Trigger declined");
                return self.settle(
                    pipeline,
                    ctx,
                    PhaseEvent::TriggerDeclined,
                    None,
                    Vec::new(),
                    None,
                );
            }
            Ok(fired) => fired,
        };

        tracing::info!(reason = %eval.reason, "Trigger fired");
        self.with_state(pipeline, |state, events| {
            advance(
                state,
                PhaseEvent::TriggerFired,
                Some(ctx.correlation_id),
                events,
            )?;
            state.task.last_triggered = Some(Utc::now());
            state.task.last_correlation_id = Some(ctx.correlation_id);
            Ok::<_, InvalidTransition>(())
        })?;

        progress.lock().recorder = Some(journal::start_cycle_journal(
            ctx,
            &eval.reason,
            &snapshot.spec.safety,
        ));
        let evidence = TriggerEvidence {
            reason: eval.reason,
            observed,
        };

        let decision = match pipeline
            .orchestrator
            .decide(snapshot, &evidence, ctx)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                let recorder = progress.record(|recorder| {
                    journal::record_decision_error(recorder, &e);
                });
                return self.settle(
                    pipeline,
                    ctx,
                    PhaseEvent::DecisionFailed,
                    Some(e.to_string()),
                    Vec::new(),
                    recorder,
                );
            }
        };

        if !decision.is_executable() {
            let records = decision
                .actions
                .iter()
                .map(|guarded| {
                    let reason = guarded.verdict.detail.clone().unwrap_or_else(|| {
                        format!("not executed: decision outcome {:?}", decision.outcome)
                    });
                    ActionRecord::skipped(ctx.correlation_id, guarded, Some(reason))
                })
                .collect();
            let recorder = progress.record(|recorder| {
                journal::record_decision(recorder, &decision);
            });
            return self.settle(
                pipeline,
                ctx,
                PhaseEvent::Decided { executable: false },
                None,
                records,
                recorder,
            );
        }

        {
            let mut cycle = progress.lock();
            if let Some(recorder) = cycle.recorder.as_mut() {
                journal::record_decision(recorder, &decision);
            }
            cycle.decision = Some(decision.clone());
        }

        self.with_state(pipeline, |state, events| {
            advance(
                state,
                PhaseEvent::Decided { executable: true },
                Some(ctx.correlation_id),
                events,
            )
            .map(|_| ())
        })?;

        let records = pipeline
            .executor
            .execute_with(&decision.actions, &snapshot.spec, ctx, |step| {
                progress.observe(step)
            })
            .await;
        let fatal = executor::cycle_failed(&records);
        let error = records
            .iter()
            .find(|r| r.outcome == ExecutionOutcome::Failed)
            .and_then(|r| r.error.clone());

        let recorder = progress.lock().recorder.take();
        self.settle(
            pipeline,
            ctx,
            PhaseEvent::Executed { fatal },
            error,
            records,
            recorder,
        )
    }

    async fn observe(
        &self,
        pipeline: &Pipeline,
        ctx: &CorrelationContext,
    ) -> Result<remedy_core::types::ObservedState> {
        match tokio::time::timeout(pipeline.observe_timeout, pipeline.observer.observe(&ctx.target))
            .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(ObserveError::Unreachable(format!(
                "no response within {}ms",
                pipeline.observe_timeout.as_millis()
            ))
            .into()),
        }
    }

    /// Apply the cycle's final event, persist its records and compute the requeue.
    fn settle(
        &self,
        pipeline: &Pipeline,
        ctx: &CorrelationContext,
        event: PhaseEvent,
        error: Option<String>,
        records: Vec<ActionRecord>,
        recorder: Option<JournalRecorder>,
    ) -> Result<CycleReport> {
        let now = Instant::now();
        let report = self.with_state(pipeline, |state, events| {
            let requeue_after = conclude(
                state,
                pipeline,
                event,
                ctx.correlation_id,
                error,
                &records,
                now,
                events,
            )?;
            let outcome = match (event, state.task.phase) {
                (PhaseEvent::TriggerDeclined, _) => CycleOutcome::Declined,
                (PhaseEvent::EvaluationFailed, _) => CycleOutcome::EvaluationFailed,
                (PhaseEvent::DecisionFailed | PhaseEvent::Executed { fatal: true }, _) => {
                    CycleOutcome::Failed
                }
                _ => CycleOutcome::Completed,
            };
            Ok::<_, InvalidTransition>(CycleReport {
                outcome,
                phase: state.task.phase,
                correlation_id: Some(ctx.correlation_id),
                requeue_after: Some(requeue_after),
                records,
            })
        })?;

        if let Some(mut recorder) = recorder {
            journal::record_outcomes(&mut recorder, &report.records);
            journal::finalize_and_store(recorder, report.phase, pipeline.journal_store());
        }

        Ok(report)
    }

    /// Close out a cycle that was dropped or failed mid-flight.
    ///
    /// Every candidate of an executing decision still gets a record, the
    /// ledger rolls back whatever this cycle left InFlight, and the journal
    /// is stored.
    fn abort(
        &self,
        pipeline: &Pipeline,
        ctx: &CorrelationContext,
        spec: &TaskSpec,
        progress: &CycleProgress,
    ) {
        let now = Instant::now();
        let correlation_id = ctx.correlation_id;
        let cycle = std::mem::take(&mut *progress.lock());
        let records = cycle.close_out(pipeline.orchestrator.guard(), spec, ctx);
        let rolled_back = pipeline.ledger().rollback_correlation(correlation_id, now);

        let phases = self.with_state(pipeline, |state, events| {
            let aborted_in = state.task.phase;
            if !aborted_in.is_in_flight() {
                return None;
            }
            tracing::warn!(
                task = %state.task.key(),
                correlation_id = %correlation_id,
                phase = %aborted_in,
                rolled_back,
                records = records.len(),
                "Cycle aborted before completion"
            );
            match conclude(
                state,
                pipeline,
                PhaseEvent::Aborted,
                correlation_id,
                Some("cycle aborted before completion".to_string()),
                &records,
                now,
                events,
            ) {
                Ok(_) => Some((aborted_in, state.task.phase)),
                Err(e) => {
                    tracing::error!(error = %e, "Abort transition rejected");
                    None
                }
            }
        });

        if let (Some(mut recorder), Some((aborted_in, final_phase))) = (cycle.recorder, phases) {
            journal::record_outcomes(&mut recorder, &records);
            journal::record_abort(&mut recorder, aborted_in);
            journal::finalize_and_store(recorder, final_phase, pipeline.journal_store());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate state under the lock, then publish the collected events.
    fn with_state<R>(
        &self,
        pipeline: &Pipeline,
        f: impl FnOnce(&mut TaskState, &mut Vec<StatusEvent>) -> R,
    ) -> R {
        let mut events = Vec::new();
        let (result, status) = {
            let mut state = self.lock();
            let result = f(&mut state, &mut events);
            let status = (!events.is_empty()).then(|| state.task.status());
            (result, status)
        };
        if let Some(status) = status {
            for event in &events {
                pipeline.sink.publish(event, &status);
            }
        }
        result
    }
}

/// Drop guard for an in-flight cycle.
struct CycleGuard<'a> {
    runtime: &'a TaskRuntime,
    pipeline: &'a Pipeline,
    ctx: &'a CorrelationContext,
    spec: &'a TaskSpec,
    progress: &'a CycleProgress,
    armed: bool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.runtime
                .abort(self.pipeline, self.ctx, self.spec, self.progress);
        }
    }
}

/// What a cycle has produced so far, where its drop guard can reach it.
#[derive(Default)]
struct CycleProgress {
    state: Mutex<ProgressState>,
}

#[derive(Default)]
struct ProgressState {
    recorder: Option<JournalRecorder>,
    /// Set once the decision is executable.
    decision: Option<Decision>,
    records: Vec<ActionRecord>,
    running: Option<RunningAction>,
}

struct RunningAction {
    index: usize,
    attempts: u32,
    started_at: DateTime<Utc>,
}

impl CycleProgress {
    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write to the journal, then hand it over for settling.
    fn record(&self, f: impl FnOnce(&mut JournalRecorder)) -> Option<JournalRecorder> {
        let mut recorder = self.lock().recorder.take()?;
        f(&mut recorder);
        Some(recorder)
    }

    fn observe(&self, step: Progress<'_>) {
        let mut state = self.lock();
        match step {
            Progress::Attempt { index, attempt } => {
                let started_at = match &state.running {
                    Some(running) if running.index == index => running.started_at,
                    _ => Utc::now(),
                };
                state.running = Some(RunningAction {
                    index,
                    attempts: attempt,
                    started_at,
                });
            }
            Progress::Recorded { index, record } => {
                if state.running.as_ref().is_some_and(|r| r.index == index) {
                    state.running = None;
                }
                state.records.push(record.clone());
            }
        }
    }
}

impl ProgressState {
    /// Finished records plus one for every candidate that has none yet.
    ///
    /// The action in flight is recorded `Failed`: it may have been applied.
    /// Approved actions that never started go back to the guard.
    fn close_out(
        &self,
        guard: &SafetyGuard,
        spec: &TaskSpec,
        ctx: &CorrelationContext,
    ) -> Vec<ActionRecord> {
        let mut records = self.records.clone();
        let Some(decision) = &self.decision else {
            return records;
        };

        for (index, guarded) in decision.actions.iter().enumerate().skip(records.len()) {
            let record = if !guarded.verdict.allowed {
                ActionRecord::skipped(ctx.correlation_id, guarded, guarded.verdict.detail.clone())
            } else if let Some(running) = self.running.as_ref().filter(|r| r.index == index) {
                ActionRecord {
                    correlation_id: ctx.correlation_id,
                    action: guarded.action.clone(),
                    verdict: guarded.verdict.clone(),
                    outcome: ExecutionOutcome::Failed,
                    error: Some("cycle aborted while the action was in flight".to_string()),
                    detail: None,
                    attempts: running.attempts,
                    started_at: running.started_at,
                    finished_at: Utc::now(),
                }
            } else {
                guard.release(guarded, spec, ctx);
                ActionRecord::skipped(
                    ctx.correlation_id,
                    guarded,
                    Some("cycle aborted before the action started".to_string()),
                )
            };
            records.push(record);
        }
        records
    }
}

fn advance(
    state: &mut TaskState,
    event: PhaseEvent,
    correlation_id: Option<CorrelationId>,
    events: &mut Vec<StatusEvent>,
) -> std::result::Result<crate::phase::Transition, InvalidTransition> {
    let from = state.task.phase;
    let next = transition(from, event)?;
    if next.next != from {
        state.task.phase = next.next;
        tracing::debug!(task = %state.task.key(), from = %from, to = %next.next, "Phase changed");
        events.push(StatusEvent::new(
            state.task.key().clone(),
            correlation_id,
            StatusPayload::PhaseChanged {
                from,
                to: next.next,
            },
        ));
    }
    Ok(next)
}

fn retire(
    state: &mut TaskState,
    events: &mut Vec<StatusEvent>,
) -> std::result::Result<(), InvalidTransition> {
    let transition = advance(state, PhaseEvent::Withdraw, None, events)?;
    state.withdraw_pending = false;
    if transition.effect == Some(Effect::Drain) {
        tracing::info!(
            task = %state.task.key(),
            history_len = state.task.history.len(),
            "Task retired"
        );
        events.push(StatusEvent::new(
            state.task.key().clone(),
            state.task.last_correlation_id,
            StatusPayload::Retired,
        ));
    }
    Ok(())
}

/// Final bookkeeping of a cycle under the Task lock. Returns the requeue delay.
#[allow(clippy::too_many_arguments)]
fn conclude(
    state: &mut TaskState,
    pipeline: &Pipeline,
    event: PhaseEvent,
    correlation_id: CorrelationId,
    error: Option<String>,
    records: &[ActionRecord],
    now: Instant,
    events: &mut Vec<StatusEvent>,
) -> std::result::Result<Duration, InvalidTransition> {
    let step = advance(state, event, Some(correlation_id), events)?;
    let task = &mut state.task;
    task.append_records(records.iter().cloned());

    match step.next {
        Phase::Completed => {
            task.consecutive_errors = 0;
            task.last_error = None;
        }
        Phase::Error => {
            task.consecutive_errors = task.consecutive_errors.saturating_add(1);
            task.last_error = error;
        }
        _ => {
            if error.is_some() {
                task.last_error = error;
            }
        }
    }

    let requeue_after = match step.effect {
        Some(Effect::Requeue(requeue)) => pipeline.requeue.delay(requeue, task.consecutive_errors),
        _ => pipeline.requeue.poll,
    };

    if matches!(step.next, Phase::Completed | Phase::Error) {
        state.rearm_at = Some(now + requeue_after);
        events.push(StatusEvent::new(
            state.task.key().clone(),
            Some(correlation_id),
            StatusPayload::CycleFinished {
                phase: step.next,
                record_count: u32::try_from(records.len()).unwrap_or(u32::MAX),
                requeue_after_ms: u64::try_from(requeue_after.as_millis()).unwrap_or(u64::MAX),
            },
        ));
    }

    if state.withdraw_pending {
        retire(state, events)?;
    }

    Ok(requeue_after)
}
