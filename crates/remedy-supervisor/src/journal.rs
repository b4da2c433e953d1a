//! Journal helpers for remediation cycles.

use serde::Serialize;

use remedy_core::types::{ActionRecord, CorrelationContext, Decision, Diagnosis, Phase};
use remedy_core::SafetyConfig;
use remedy_journal::recorder::JournalRecorder;
use remedy_journal::store::JournalStore;
use remedy_journal::CycleJournal;

use crate::orchestrator::DecisionError;

/// Open a journal for a cycle whose trigger fired.
pub fn start_cycle_journal(
    ctx: &CorrelationContext,
    trigger_reason: &str,
    safety: &SafetyConfig,
) -> JournalRecorder {
    let mut recorder = JournalRecorder::new(
        ctx.correlation_id.0,
        &ctx.task.to_string(),
        &ctx.target.to_string(),
        trigger_reason,
    );
    recorder.set_context(serde_json::json!({
        "mode": label(&safety.mode),
        "allowed_types": safety.allowed_types,
        "allow_high_impact": safety.allow_high_impact,
        "max_concurrency": safety.max_concurrency,
    }));
    recorder
}

/// Record the diagnosis, the guard's verdicts and the approval gate.
///
/// A decision without a diagnosis never reached the recommend stage, so
/// only its approval entry is written.
pub fn record_decision(recorder: &mut JournalRecorder, decision: &Decision) {
    if let Some(diagnosis) = &decision.diagnosis {
        record_analysis(recorder, diagnosis);
        recorder.add_stage(
            "recommend",
            &format!("{} candidate action(s)", decision.actions.len()),
            serde_json::json!({ "confidence": decision.confidence }),
        );
        for guarded in &decision.actions {
            recorder.add_verdict(
                &guarded.action.action_type,
                &guarded.action.fingerprint().0,
                guarded.verdict.allowed,
                &label(&guarded.verdict.reason),
                guarded.verdict.detail.as_deref(),
            );
        }
    }

    recorder.add_stage(
        "approve",
        &decision.rationale,
        serde_json::json!({
            "outcome": label(&decision.outcome),
            "approved": decision.approved,
        }),
    );
}

/// Record a reasoning failure that aborted the decision, plus the
/// diagnosis if analysis got that far.
pub fn record_decision_error(recorder: &mut JournalRecorder, error: &DecisionError) {
    if let Some(diagnosis) = &error.decision.diagnosis {
        record_analysis(recorder, diagnosis);
    }
    recorder.add_stage(
        "error",
        &error.to_string(),
        serde_json::json!({
            "stage": error.stage.to_string(),
            "rationale": error.decision.rationale,
        }),
    );
}

/// Record that the cycle was cancelled before it finished.
pub fn record_abort(recorder: &mut JournalRecorder, phase: Phase) {
    recorder.add_stage(
        "abort",
        "cycle aborted before completion",
        serde_json::json!({ "phase": phase.to_string() }),
    );
}

fn record_analysis(recorder: &mut JournalRecorder, diagnosis: &Diagnosis) {
    recorder.add_stage(
        "analyze",
        &diagnosis.summary,
        serde_json::json!({
            "confidence": diagnosis.confidence,
            "evidence": diagnosis.evidence,
        }),
    );
}

/// Record one outcome entry per candidate action.
pub fn record_outcomes(recorder: &mut JournalRecorder, records: &[ActionRecord]) {
    for record in records {
        recorder.add_outcome(
            &record.action.action_type,
            &label(&record.outcome),
            record.attempts,
            record.error.as_deref(),
        );
    }
}

/// Finalize the journal and store it. Store failures are logged only.
pub fn finalize_and_store(
    recorder: JournalRecorder,
    final_phase: Phase,
    store: Option<&dyn JournalStore>,
) -> CycleJournal {
    let journal = recorder.finalize(&final_phase.to_string());

    if let Some(store) = store {
        match store.save(&journal) {
            Ok(()) => tracing::info!(journal_id = %journal.id, "Cycle journal recorded"),
            Err(e) => tracing::warn!(journal_id = %journal.id, error = %e, "Failed to store cycle journal"),
        }
    }

    journal
}

/// The serde name of a unit enum variant, e.g. `duplicate_in_flight`.
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => String::new(),
    }
}
