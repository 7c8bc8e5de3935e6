/// Idempotency index for create requests
///
/// Maps `(flow, client_key)` to the transaction that first claimed it so a
/// retried create collapses onto the existing record instead of minting a
/// second invoice. Entries linger for 24 hours after their transaction
/// reaches a terminal state, then the GC sweeper drops them.
///
/// The store's unique index on `(flow, idempotency_key)` stays as the
/// durable backstop; this index is the strictly consistent fast path.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sambaza_types::{Flow, TransactionId};
use std::collections::HashMap;

const RETENTION_AFTER_TERMINAL: i64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
struct Entry {
    tx_id: TransactionId,
    /// Set when the owning transaction reaches a terminal state
    terminal_at: Option<DateTime<Utc>>,
}

/// Result of a reservation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    Existing(TransactionId),
}

#[derive(Default)]
pub struct IdempotencyIndex {
    entries: Mutex<HashMap<(Flow, String), Entry>>,
}

impl IdempotencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `(flow, key)` for `tx_id`, or learn who already holds it.
    pub fn reserve(&self, flow: Flow, key: &str, tx_id: TransactionId) -> Reservation {
        let mut entries = self.entries.lock();
        match entries.get(&(flow, key.to_string())) {
            Some(existing) => Reservation::Existing(existing.tx_id),
            None => {
                entries.insert((flow, key.to_string()), Entry { tx_id, terminal_at: None });
                Reservation::Reserved
            }
        }
    }

    /// Release a reservation that never produced a transaction (invoice
    /// creation failed before the record existed).
    pub fn release(&self, flow: Flow, key: &str, tx_id: TransactionId) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&(flow, key.to_string())) {
            if entry.tx_id == tx_id {
                entries.remove(&(flow, key.to_string()));
            }
        }
    }

    /// Start the 24 h retention countdown for a finished transaction.
    pub fn mark_terminal(&self, tx_id: TransactionId, at: DateTime<Utc>) {
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            if entry.tx_id == tx_id && entry.terminal_at.is_none() {
                entry.terminal_at = Some(at);
            }
        }
    }

    /// Drop entries whose retention has elapsed. Returns how many went.
    pub fn expire(&self, now: DateTime<Utc>) -> usize {
        let cutoff = Duration::seconds(RETENTION_AFTER_TERMINAL);
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| match entry.terminal_at {
            Some(terminal_at) => now - terminal_at < cutoff,
            None => true,
        });
        before - entries.len()
    }
}
