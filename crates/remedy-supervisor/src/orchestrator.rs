//! Decision orchestration: Analyze → Recommend → Guard → Approve.
//!
//! Produces exactly one `Decision` per cycle. Reasoning calls are bounded
//! by a per-stage timeout and never retried here; a failed call aborts the
//! cycle and the reconciler re-arms the Task with backoff.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use remedy_core::types::{
    Action, ApprovalOutcome, CorrelationContext, Decision, Diagnosis, GuardedAction, Task,
};
use remedy_core::{OperatingMode, ReasoningError, SafetyConfig};

use crate::collaborator::{
    AnalysisRequest, ReasoningEngine, Recommendation, RecommendationRequest, TriggerEvidence,
};
use crate::guard::SafetyGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Analyze,
    Recommend,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Analyze => f.write_str("analyze"),
            Self::Recommend => f.write_str("recommend"),
        }
    }
}

/// A cycle aborted by a reasoning failure.
///
/// Still carries an unapproved `Decision` so the failure is auditable.
#[derive(Error, Debug)]
#[error("decision aborted in {stage} stage: {source}")]
pub struct DecisionError {
    pub stage: Stage,
    pub decision: Box<Decision>,
    #[source]
    pub source: ReasoningError,
}

pub struct DecisionOrchestrator {
    engine: Arc<dyn ReasoningEngine>,
    guard: Arc<SafetyGuard>,
    stage_timeout: Duration,
    history_window: usize,
}

impl DecisionOrchestrator {
    pub fn new(
        engine: Arc<dyn ReasoningEngine>,
        guard: Arc<SafetyGuard>,
        stage_timeout: Duration,
        history_window: usize,
    ) -> Self {
        Self {
            engine,
            guard,
            stage_timeout,
            history_window,
        }
    }

    pub fn guard(&self) -> &Arc<SafetyGuard> {
        &self.guard
    }

    /// Run all four stages for one triggered cycle on `task`.
    pub async fn decide(
        &self,
        task: &Task,
        evidence: &TriggerEvidence,
        correlation: &CorrelationContext,
    ) -> Result<Decision, DecisionError> {
        let spec = &task.spec;

        let analysis = AnalysisRequest {
            correlation_id: correlation.correlation_id,
            task: spec.key.clone(),
            target: correlation.target.clone(),
            evidence: evidence.clone(),
            recent_history: task.recent_history(self.history_window),
            safety: spec.safety.clone(),
        };
        let diagnosis = self
            .bounded(Stage::Analyze, self.engine.analyze(&analysis))
            .await
            .and_then(validate_diagnosis)
            .map_err(|e| abort(Stage::Analyze, None, e, correlation))?;

        tracing::info!(
            summary = %diagnosis.summary,
            confidence = diagnosis.confidence,
            "Analysis complete"
        );

        let request = RecommendationRequest {
            correlation_id: correlation.correlation_id,
            task: spec.key.clone(),
            target: correlation.target.clone(),
            diagnosis: diagnosis.clone(),
            safety: spec.safety.clone(),
        };
        let recommendation = self
            .bounded(Stage::Recommend, self.engine.recommend(&request))
            .await
            .and_then(validate_recommendation)
            .map_err(|e| abort(Stage::Recommend, Some(&diagnosis), e, correlation))?;

        let candidates: Vec<Action> = recommendation
            .actions
            .into_iter()
            .map(|proposed| proposed.into_action(&spec.target))
            .collect();
        let proposed = candidates.len();
        let guarded = self.guard.evaluate_all(candidates, spec, correlation);

        let (outcome, gate_note) = approval_gate(&spec.safety, &guarded, proposed);
        if outcome != ApprovalOutcome::Approve {
            for candidate in &guarded {
                self.guard.release(candidate, spec, correlation);
            }
        }

        let survivors = guarded.iter().filter(|g| g.verdict.allowed).count();
        tracing::info!(
            proposed,
            survivors,
            outcome = ?outcome,
            "Decision made"
        );

        Ok(Decision {
            correlation_id: correlation.correlation_id,
            approved: outcome == ApprovalOutcome::Approve,
            outcome,
            actions: guarded,
            diagnosis: Some(diagnosis),
            rationale: format!("{}; {}", recommendation.rationale, gate_note),
            confidence: recommendation.confidence,
            decided_at: Utc::now(),
        })
    }

    async fn bounded<T, F>(&self, stage: Stage, call: F) -> Result<T, ReasoningError>
    where
        F: Future<Output = Result<T, ReasoningError>>,
    {
        match tokio::time::timeout(self.stage_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ReasoningError::Timeout {
                stage: stage.to_string(),
                timeout_ms: u64::try_from(self.stage_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

fn abort(
    stage: Stage,
    diagnosis: Option<&Diagnosis>,
    source: ReasoningError,
    correlation: &CorrelationContext,
) -> DecisionError {
    tracing::warn!(stage = %stage, error = %source, "Reasoning call failed, aborting cycle");
    DecisionError {
        stage,
        decision: Box::new(Decision {
            correlation_id: correlation.correlation_id,
            approved: false,
            outcome: ApprovalOutcome::Reject,
            actions: Vec::new(),
            diagnosis: diagnosis.cloned(),
            rationale: format!("{stage} stage failed: {source}"),
            confidence: 0.0,
            decided_at: Utc::now(),
        }),
        source,
    }
}

fn validate_confidence(confidence: f64) -> Result<(), ReasoningError> {
    if confidence.is_finite() && (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(ReasoningError::Malformed(format!(
            "confidence {confidence} outside [0, 1]"
        )))
    }
}

fn validate_diagnosis(diagnosis: Diagnosis) -> Result<Diagnosis, ReasoningError> {
    validate_confidence(diagnosis.confidence)?;
    Ok(diagnosis)
}

fn validate_recommendation(rec: Recommendation) -> Result<Recommendation, ReasoningError> {
    validate_confidence(rec.confidence)?;
    if let Some(index) = rec
        .actions
        .iter()
        .position(|a| a.action_type.trim().is_empty())
    {
        return Err(ReasoningError::Malformed(format!(
            "proposed action #{index} has no type"
        )));
    }
    Ok(rec)
}

/// The final gate. Returns the outcome and a note for the rationale.
fn approval_gate(
    safety: &SafetyConfig,
    guarded: &[GuardedAction],
    proposed: usize,
) -> (ApprovalOutcome, String) {
    match safety.mode {
        OperatingMode::DryRun | OperatingMode::Simulate => {
            return (
                ApprovalOutcome::Simulated,
                format!("{proposed} action(s) retained for audit only"),
            )
        }
        OperatingMode::Enact => {}
    }

    let survivors: Vec<&GuardedAction> = guarded.iter().filter(|g| g.verdict.allowed).collect();
    if survivors.is_empty() {
        let note = if proposed == 0 {
            "no action proposed".to_string()
        } else {
            format!("none of {proposed} action(s) passed the safety guard")
        };
        return (ApprovalOutcome::Reject, note);
    }

    if let Some(gated) = survivors
        .iter()
        .find(|g| safety.require_approval_for.contains(&g.action.impact))
    {
        return (
            ApprovalOutcome::HumanReview,
            format!(
                "'{}' has {:?} impact and requires human approval",
                gated.action.action_type, gated.action.impact
            ),
        );
    }

    (
        ApprovalOutcome::Approve,
        format!("{} of {proposed} action(s) approved", survivors.len()),
    )
}
