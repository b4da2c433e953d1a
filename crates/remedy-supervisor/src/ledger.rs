//! Idempotency ledger: fingerprint → last-known outcome.
//!
//! Reservation is a single compare-and-set under the ledger lock, so two
//! workers racing on one fingerprint can never both observe "absent".
//! Completed entries block re-execution for the whole retention window;
//! InFlight entries expire after a shorter TTL so an abandoned cycle
//! cannot block an action forever.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use remedy_core::types::{CorrelationId, Fingerprint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    InFlight,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyEntry {
    pub state: EntryState,
    pub recorded_at: Instant,
    pub correlation_id: CorrelationId,
}

/// Result of an attempt to reserve a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    DuplicateInFlight { holder: CorrelationId },
    AlreadyCompleted { by: CorrelationId },
}

#[derive(Debug)]
pub struct IdempotencyLedger {
    entries: Mutex<HashMap<Fingerprint, IdempotencyEntry>>,
    retention: Duration,
    in_flight_ttl: Duration,
}

impl IdempotencyLedger {
    pub fn new(retention: Duration, in_flight_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
            in_flight_ttl,
        }
    }

    fn is_live(&self, entry: &IdempotencyEntry, now: Instant) -> bool {
        let ttl = match entry.state {
            EntryState::InFlight => self.in_flight_ttl,
            EntryState::Completed | EntryState::Failed => self.retention,
        };
        now.saturating_duration_since(entry.recorded_at) < ttl
    }

    /// Atomically check `fingerprint` and record it InFlight if free.
    pub fn try_reserve(
        &self,
        fingerprint: &Fingerprint,
        correlation_id: CorrelationId,
        now: Instant,
    ) -> Reservation {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = entries.get(fingerprint) {
            if self.is_live(entry, now) {
                match entry.state {
                    EntryState::InFlight => {
                        return Reservation::DuplicateInFlight {
                            holder: entry.correlation_id,
                        }
                    }
                    EntryState::Completed => {
                        return Reservation::AlreadyCompleted {
                            by: entry.correlation_id,
                        }
                    }
                    EntryState::Failed => {}
                }
            }
        }

        entries.insert(
            fingerprint.clone(),
            IdempotencyEntry {
                state: EntryState::InFlight,
                recorded_at: now,
                correlation_id,
            },
        );
        Reservation::Reserved
    }

    /// What `try_reserve` would answer, without recording anything.
    pub fn peek(&self, fingerprint: &Fingerprint, now: Instant) -> Option<EntryState> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(fingerprint)
            .filter(|entry| self.is_live(entry, now))
            .map(|entry| entry.state)
    }

    /// InFlight → Completed for the reservation held by `correlation_id`.
    pub fn mark_completed(
        &self,
        fingerprint: &Fingerprint,
        correlation_id: CorrelationId,
        now: Instant,
    ) -> bool {
        self.resolve(fingerprint, correlation_id, EntryState::Completed, now)
    }

    /// InFlight → Failed for the reservation held by `correlation_id`.
    pub fn mark_failed(
        &self,
        fingerprint: &Fingerprint,
        correlation_id: CorrelationId,
        now: Instant,
    ) -> bool {
        self.resolve(fingerprint, correlation_id, EntryState::Failed, now)
    }

    fn resolve(
        &self,
        fingerprint: &Fingerprint,
        correlation_id: CorrelationId,
        state: EntryState,
        now: Instant,
    ) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(fingerprint) {
            Some(entry)
                if entry.state == EntryState::InFlight
                    && entry.correlation_id == correlation_id =>
            {
                entry.state = state;
                entry.recorded_at = now;
                true
            }
            _ => false,
        }
    }

    /// Refresh an InFlight reservation still held by `correlation_id`, just
    /// before its action runs. False if it expired and another cycle took it
    /// over, or it was resolved or released meanwhile.
    pub fn renew(
        &self,
        fingerprint: &Fingerprint,
        correlation_id: CorrelationId,
        now: Instant,
    ) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(fingerprint) {
            Some(entry)
                if entry.state == EntryState::InFlight
                    && entry.correlation_id == correlation_id =>
            {
                entry.recorded_at = now;
                true
            }
            _ => false,
        }
    }

    /// Drop an InFlight reservation whose action was never attempted.
    pub fn release(&self, fingerprint: &Fingerprint, correlation_id: CorrelationId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let held = entries.get(fingerprint).is_some_and(|entry| {
            entry.state == EntryState::InFlight && entry.correlation_id == correlation_id
        });
        if held {
            entries.remove(fingerprint);
        }
        held
    }

    /// Mark every InFlight entry of an aborted cycle as Failed.
    pub fn rollback_correlation(&self, correlation_id: CorrelationId, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rolled_back = 0;
        for entry in entries.values_mut() {
            if entry.state == EntryState::InFlight && entry.correlation_id == correlation_id {
                entry.state = EntryState::Failed;
                entry.recorded_at = now;
                rolled_back += 1;
            }
        }
        rolled_back
    }

    /// Forget expired entries. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| self.is_live(entry, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
