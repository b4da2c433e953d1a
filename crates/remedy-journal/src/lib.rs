//! remedy-journal: Tamper-evident record of remediation cycles.
//!
//! A journal captures one trigger-to-completion cycle: why it started,
//! what each pipeline stage concluded, the guard's verdict on every
//! candidate action, and what happened when actions ran. Each journal
//! is content-hashed with BLAKE3 on finalization so that later edits
//! are detectable.

pub mod hash;
pub mod recorder;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Core Types ───────────────────────────────────────────────────

/// Journal identifier. Equal to the cycle's correlation id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JournalId(pub Uuid);

impl std::fmt::Display for JournalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conclusion of one pipeline stage (analyze, recommend, approve, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageEntry {
    pub stage: String,
    pub summary: String,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// The guard's verdict on one candidate action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerdictEntry {
    pub action_type: String,
    pub fingerprint: String,
    pub allowed: bool,
    pub reason: String,
    pub detail: Option<String>,
}

/// What happened to one candidate action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeEntry {
    pub action_type: String,
    pub outcome: String,
    pub attempts: u32,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// The complete audit trail of one remediation cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleJournal {
    pub id: JournalId,
    /// Task key (`namespace/name`).
    pub task: String,
    /// Target descriptor snapshot.
    pub target: String,
    pub trigger_reason: String,
    /// Context provided at cycle start (safety snapshot, evidence).
    pub context: serde_json::Value,
    pub stages: Vec<StageEntry>,
    pub verdicts: Vec<VerdictEntry>,
    pub outcomes: Vec<OutcomeEntry>,
    /// Phase the Task ended the cycle in.
    pub final_phase: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// BLAKE3 content hash (hex), set on finalization.
    pub content_hash: Option<String>,
}

impl CycleJournal {
    /// BLAKE3 hash over every field except `content_hash`.
    pub fn compute_hash(&self) -> String {
        hash::compute_journal_hash(self)
    }

    /// Verify that the stored content_hash matches a freshly computed hash.
    pub fn verify_integrity(&self) -> bool {
        match &self.content_hash {
            Some(stored) => stored == &self.compute_hash(),
            None => false,
        }
    }
}
