/// Transaction store: the durable record of every transaction
///
/// The store is the only mutable shared state in the bridge. All mutations
/// go through `transition`, which validates the move against the canonical
/// state graph, applies the mutator, bumps the version and appends the
/// ledger event in one atomic unit. Two concurrent transitions on the same
/// row resolve to exactly one winner; the loser sees `StaleVersion`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sambaza_errors::Result;
use sambaza_types::{
    EventKind, Flow, PaymentHash, Receipt, Transaction, TransactionEvent, TransactionId, TxState,
};

mod memory;
mod postgres;

pub use memory::MemoryTransactionStore;
pub use postgres::PgTransactionStore;

/// Mutation applied to the row while the transition holds it
pub type Mutator = Box<dyn FnOnce(&mut Transaction) + Send>;

/// One atomic state change request
pub struct Transition {
    pub id: TransactionId,
    pub expected_state: TxState,
    pub expected_version: i64,
    pub new_state: TxState,
    pub event: EventKind,
    pub at: DateTime<Utc>,
    /// Extra field updates applied together with the state change
    pub mutate: Option<Mutator>,
}

impl Transition {
    pub fn new(
        tx: &Transaction,
        new_state: TxState,
        event: EventKind,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: tx.id,
            expected_state: tx.state,
            expected_version: tx.version,
            new_state,
            event,
            at,
            mutate: None,
        }
    }

    pub fn with_mutation(mut self, mutate: impl FnOnce(&mut Transaction) + Send + 'static) -> Self {
        self.mutate = Some(Box::new(mutate));
        self
    }
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a new transaction and its `Created` ledger entry.
    /// Fails with DuplicatePaymentHash / DuplicateIdempotencyKey.
    async fn create(&self, tx: Transaction) -> Result<Transaction>;

    async fn get(&self, id: TransactionId) -> Result<Transaction>;

    async fn get_by_payment_hash(&self, hash: &PaymentHash) -> Result<Transaction>;

    /// Resolve the Daraja account-reference slot (leading hex of the
    /// payment hash) back to its transaction.
    async fn get_by_payment_hash_prefix(&self, prefix: &str) -> Result<Transaction>;

    async fn get_by_conversation_id(&self, conversation_id: &str) -> Result<Transaction>;

    async fn find_by_idempotency_key(&self, flow: Flow, key: &str) -> Result<Option<Transaction>>;

    /// Atomically move a transaction to a new state and append the event.
    async fn transition(&self, transition: Transition) -> Result<Transaction>;

    /// Append a ledger entry without a state change (dedup notes, stale
    /// settlement markers, receipt issuance). Keeps seq gap-free.
    async fn append_note(&self, id: TransactionId, kind: EventKind, at: DateTime<Utc>)
        -> Result<()>;

    /// LIGHTNING_PENDING rows whose quote window has elapsed.
    async fn list_expiring(&self, before: DateTime<Utc>) -> Result<Vec<Transaction>>;

    /// Rows sitting in `state` with no update since `updated_before`.
    async fn list_in_state_older_than(
        &self,
        state: TxState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Transaction>>;

    /// Full event ledger for a transaction, ordered by seq.
    async fn events(&self, id: TransactionId) -> Result<Vec<TransactionEvent>>;

    async fn insert_receipt(&self, receipt: Receipt) -> Result<()>;

    async fn get_receipt(&self, tx_id: TransactionId) -> Result<Option<Receipt>>;
}

/// Replay a transaction's ledger from scratch and return the final state
///
/// The ledger is authoritative: replaying it must land on the state the
/// materialised row carries. Used by tests and audit tooling.
pub fn replay_state(events: &[TransactionEvent]) -> Option<TxState> {
    events.last().map(|e| e.state)
}
