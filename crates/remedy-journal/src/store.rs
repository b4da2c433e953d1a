//! Journal persistence.
//!
//! Journals are written as JSON files laid out by cycle start date:
//! ```text
//! {root}/
//!   2026/
//!     10/
//!       19/
//!         {correlation_id}.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::{CycleJournal, JournalId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Journal not found: {0}")]
    NotFound(JournalId),

    #[error("Integrity check failed for journal {0}: stored hash does not match content")]
    IntegrityViolation(JournalId),

    #[error("Journal has no content hash (not finalized)")]
    NotFinalized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Filters for listing journals. Unset fields match everything.
#[derive(Debug, Default)]
pub struct JournalQuery {
    /// Task key (`namespace/name`).
    pub task: Option<String>,
    pub correlation_id: Option<JournalId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Cap on results after sorting, newest first.
    pub limit: Option<usize>,
}

impl JournalQuery {
    fn matches(&self, journal: &CycleJournal) -> bool {
        if self.task.as_ref().is_some_and(|t| t != &journal.task) {
            return false;
        }
        if self.correlation_id.is_some_and(|id| id != journal.id) {
            return false;
        }
        if self.from.is_some_and(|from| journal.started_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| journal.started_at > to) {
            return false;
        }
        true
    }
}

pub trait JournalStore {
    /// Store a finalized journal.
    fn save(&self, journal: &CycleJournal) -> Result<(), StoreError>;

    /// Load a journal by id, verifying integrity.
    fn get(&self, id: JournalId) -> Result<CycleJournal, StoreError>;

    /// Journals matching the query, newest first.
    fn list(&self, query: &JournalQuery) -> Result<Vec<CycleJournal>, StoreError>;
}

/// File-system backed journal store.
pub struct FileJournalStore {
    root: PathBuf,
}

impl FileJournalStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn journal_path(&self, journal: &CycleJournal) -> PathBuf {
        let date = journal.started_at.format("%Y/%m/%d");
        self.root.join(format!("{}/{}.json", date, journal.id))
    }

    fn find_path(&self, id: JournalId) -> Result<PathBuf, StoreError> {
        let filename = format!("{id}.json");
        find_file(&self.root, &filename).ok_or(StoreError::NotFound(id))
    }
}

impl JournalStore for FileJournalStore {
    fn save(&self, journal: &CycleJournal) -> Result<(), StoreError> {
        if journal.content_hash.is_none() {
            return Err(StoreError::NotFinalized);
        }

        let path = self.journal_path(journal);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(journal)?)?;

        tracing::debug!(
            journal_id = %journal.id,
            path = %path.display(),
            "Journal saved"
        );
        Ok(())
    }

    fn get(&self, id: JournalId) -> Result<CycleJournal, StoreError> {
        let path = self.find_path(id)?;
        let journal: CycleJournal = serde_json::from_str(&fs::read_to_string(&path)?)?;

        if !journal.verify_integrity() {
            return Err(StoreError::IntegrityViolation(id));
        }
        Ok(journal)
    }

    fn list(&self, query: &JournalQuery) -> Result<Vec<CycleJournal>, StoreError> {
        let mut results = Vec::new();
        collect_journals(&self.root, query, &mut results)?;

        results.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }
}

fn find_file(dir: &Path, filename: &str) -> Option<PathBuf> {
    for entry in fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file(&path, filename) {
                return Some(found);
            }
        } else if path.file_name().and_then(|n| n.to_str()) == Some(filename) {
            return Some(path);
        }
    }
    None
}

fn collect_journals(
    dir: &Path,
    query: &JournalQuery,
    results: &mut Vec<CycleJournal>,
) -> Result<(), StoreError> {
    if !dir.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_journals(&path, query, results)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let journal: CycleJournal = serde_json::from_str(&fs::read_to_string(&path)?)?;
            if query.matches(&journal) {
                results.push(journal);
            }
        }
    }
    Ok(())
}
