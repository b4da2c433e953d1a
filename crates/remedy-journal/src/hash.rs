//! BLAKE3 content hashing for tamper evidence.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{CycleJournal, JournalId, OutcomeEntry, StageEntry, VerdictEntry};

/// Hashable view of a journal (excludes content_hash).
#[derive(Serialize)]
struct HashableJournal<'a> {
    id: &'a JournalId,
    task: &'a str,
    target: &'a str,
    trigger_reason: &'a str,
    context: &'a serde_json::Value,
    stages: &'a [StageEntry],
    verdicts: &'a [VerdictEntry],
    outcomes: &'a [OutcomeEntry],
    final_phase: &'a Option<String>,
    started_at: &'a DateTime<Utc>,
    completed_at: &'a Option<DateTime<Utc>>,
}

/// Compute the hex BLAKE3 hash of a journal's content.
pub fn compute_journal_hash(journal: &CycleJournal) -> String {
    let hashable = HashableJournal {
        id: &journal.id,
        task: &journal.task,
        target: &journal.target,
        trigger_reason: &journal.trigger_reason,
        context: &journal.context,
        stages: &journal.stages,
        verdicts: &journal.verdicts,
        outcomes: &journal.outcomes,
        final_phase: &journal.final_phase,
        started_at: &journal.started_at,
        completed_at: &journal.completed_at,
    };

    // JSON values, strings and timestamps always serialize.
    let json = serde_json::to_vec(&hashable).unwrap_or_default();
    blake3::hash(&json).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::recorder::JournalRecorder;

    #[test]
    fn hash_is_stable_and_sensitive() {
        let mut recorder = JournalRecorder::new(
            Uuid::new_v4(),
            "shop/checkout",
            "Deployment/shop/checkout",
            "restarts >= 3",
        );
        recorder.add_stage("analyze", "crash loop", serde_json::json!({}));
        let journal = recorder.finalize("completed");

        assert_eq!(journal.compute_hash(), journal.compute_hash());

        let mut edited = journal.clone();
        edited.trigger_reason = "manual".to_string();
        assert_ne!(journal.compute_hash(), edited.compute_hash());
    }
}
