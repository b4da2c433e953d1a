//! Builder-style recorder used while a cycle runs:
//!
//! ```no_run
//! # use remedy_journal::recorder::JournalRecorder;
//! # use uuid::Uuid;
//! let mut recorder = JournalRecorder::new(
//!     Uuid::new_v4(),
//!     "shop/checkout",
//!     "Deployment/shop/checkout",
//!     "event FailedMount seen 3 times",
//! );
//! recorder.set_context(serde_json::json!({"mode": "enact"}));
//! recorder.add_stage("analyze", "Volume mount failure", serde_json::json!({}));
//! recorder.add_verdict("restart", "ab12...", true, "approved", None);
//! recorder.add_outcome("restart", "succeeded", 1, None);
//! let journal = recorder.finalize("completed");
//! assert!(journal.content_hash.is_some());
//! ```

use chrono::Utc;
use uuid::Uuid;

use crate::{CycleJournal, JournalId, OutcomeEntry, StageEntry, VerdictEntry};

pub struct JournalRecorder {
    journal: CycleJournal,
}

impl JournalRecorder {
    pub fn new(correlation_id: Uuid, task: &str, target: &str, trigger_reason: &str) -> Self {
        Self {
            journal: CycleJournal {
                id: JournalId(correlation_id),
                task: task.to_string(),
                target: target.to_string(),
                trigger_reason: trigger_reason.to_string(),
                context: serde_json::Value::Null,
                stages: Vec::new(),
                verdicts: Vec::new(),
                outcomes: Vec::new(),
                final_phase: None,
                started_at: Utc::now(),
                completed_at: None,
                content_hash: None,
            },
        }
    }

    pub fn set_context(&mut self, context: serde_json::Value) {
        self.journal.context = context;
    }

    pub fn add_stage(&mut self, stage: &str, summary: &str, detail: serde_json::Value) {
        self.journal.stages.push(StageEntry {
            stage: stage.to_string(),
            summary: summary.to_string(),
            detail,
            timestamp: Utc::now(),
        });
    }

    pub fn add_verdict(
        &mut self,
        action_type: &str,
        fingerprint: &str,
        allowed: bool,
        reason: &str,
        detail: Option<&str>,
    ) {
        self.journal.verdicts.push(VerdictEntry {
            action_type: action_type.to_string(),
            fingerprint: fingerprint.to_string(),
            allowed,
            reason: reason.to_string(),
            detail: detail.map(String::from),
        });
    }

    pub fn add_outcome(
        &mut self,
        action_type: &str,
        outcome: &str,
        attempts: u32,
        error: Option<&str>,
    ) {
        self.journal.outcomes.push(OutcomeEntry {
            action_type: action_type.to_string(),
            outcome: outcome.to_string(),
            attempts,
            error: error.map(String::from),
            timestamp: Utc::now(),
        });
    }

    pub fn id(&self) -> JournalId {
        self.journal.id
    }

    /// Seal the journal: record the final phase, completion time, and content hash.
    pub fn finalize(mut self, final_phase: &str) -> CycleJournal {
        self.journal.final_phase = Some(final_phase.to_string());
        self.journal.completed_at = Some(Utc::now());
        let hash = self.journal.compute_hash();
        self.journal.content_hash = Some(hash);
        self.journal
    }
}
