/// In-memory transaction store
///
/// Single-node deployments and the test suite run on this store. One mutex
/// guards the whole table, which makes every operation strictly consistent
/// and gives `transition` its atomicity for free.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sambaza_errors::{BridgeError, Result};
use sambaza_types::{
    EventKind, Flow, PaymentHash, Receipt, Transaction, TransactionEvent, TransactionId, TxState,
};
use std::collections::HashMap;

use super::{Transition, TransactionStore};

#[derive(Default)]
struct Inner {
    transactions: HashMap<TransactionId, Transaction>,
    by_payment_hash: HashMap<String, TransactionId>,
    by_conversation: HashMap<String, TransactionId>,
    by_idempotency: HashMap<(Flow, String), TransactionId>,
    events: HashMap<TransactionId, Vec<TransactionEvent>>,
    receipts: HashMap<TransactionId, Receipt>,
}

#[derive(Default)]
pub struct MemoryTransactionStore {
    inner: Mutex<Inner>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn append_event_locked(
        inner: &mut Inner,
        tx_id: TransactionId,
        kind: EventKind,
        at: DateTime<Utc>,
        state: TxState,
    ) {
        let ledger = inner.events.entry(tx_id).or_default();
        let seq = ledger.last().map(|e| e.seq + 1).unwrap_or(0);
        ledger.push(TransactionEvent { tx_id, seq, kind, at, state });
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn create(&self, tx: Transaction) -> Result<Transaction> {
        let mut inner = self.inner.lock();

        if inner.by_payment_hash.contains_key(tx.payment_hash.as_str()) {
            return Err(BridgeError::DuplicatePaymentHash);
        }
        if let Some(key) = &tx.idempotency_key {
            if let Some(existing) = inner.by_idempotency.get(&(tx.flow, key.clone())) {
                return Err(BridgeError::DuplicateIdempotencyKey { existing: *existing });
            }
        }

        inner.by_payment_hash.insert(tx.payment_hash.as_str().to_string(), tx.id);
        if let Some(key) = &tx.idempotency_key {
            inner.by_idempotency.insert((tx.flow, key.clone()), tx.id);
        }
        Self::append_event_locked(&mut inner, tx.id, EventKind::Created, tx.created_at, tx.state);
        inner.transactions.insert(tx.id, tx.clone());

        Ok(tx)
    }

    async fn get(&self, id: TransactionId) -> Result<Transaction> {
        self.inner.lock().transactions.get(&id).cloned().ok_or(BridgeError::NotFound)
    }

    async fn get_by_payment_hash(&self, hash: &PaymentHash) -> Result<Transaction> {
        let inner = self.inner.lock();
        inner
            .by_payment_hash
            .get(hash.as_str())
            .and_then(|id| inner.transactions.get(id))
            .cloned()
            .ok_or(BridgeError::NotFound)
    }

    async fn get_by_payment_hash_prefix(&self, prefix: &str) -> Result<Transaction> {
        let inner = self.inner.lock();
        let mut matches = inner
            .by_payment_hash
            .iter()
            .filter(|(hash, _)| hash.starts_with(prefix))
            .map(|(_, id)| *id);

        let id = matches.next().ok_or(BridgeError::NotFound)?;
        if matches.next().is_some() {
            // 12 hex chars of collision space; treat ambiguity as missing
            return Err(BridgeError::NotFound);
        }
        inner.transactions.get(&id).cloned().ok_or(BridgeError::NotFound)
    }

    async fn get_by_conversation_id(&self, conversation_id: &str) -> Result<Transaction> {
        let inner = self.inner.lock();
        inner
            .by_conversation
            .get(conversation_id)
            .and_then(|id| inner.transactions.get(id))
            .cloned()
            .ok_or(BridgeError::NotFound)
    }

    async fn find_by_idempotency_key(&self, flow: Flow, key: &str) -> Result<Option<Transaction>> {
        let inner = self.inner.lock();
        Ok(inner
            .by_idempotency
            .get(&(flow, key.to_string()))
            .and_then(|id| inner.transactions.get(id))
            .cloned())
    }

    async fn transition(&self, transition: Transition) -> Result<Transaction> {
        let mut inner = self.inner.lock();

        let current = inner
            .transactions
            .get(&transition.id)
            .cloned()
            .ok_or(BridgeError::NotFound)?;

        if current.version != transition.expected_version
            || current.state != transition.expected_state
        {
            return Err(BridgeError::StaleVersion { id: transition.id });
        }

        if !current.state.can_transition_to(transition.new_state) {
            return Err(BridgeError::IllegalTransition {
                id: transition.id,
                from: current.state,
                to: transition.new_state,
            });
        }

        let mut updated = current;
        if let Some(mutate) = transition.mutate {
            mutate(&mut updated);
        }
        updated.state = transition.new_state;
        updated.updated_at = transition.at;
        updated.version += 1;

        // mpesa_receipt non-null iff COMPLETED
        let has_receipt = updated.mpesa_receipt.is_some();
        if has_receipt != (updated.state == TxState::Completed) {
            return Err(BridgeError::InvariantViolation {
                message: format!(
                    "mpesa_receipt presence ({has_receipt}) does not match state {}",
                    updated.state
                ),
            });
        }

        if let Some(conv) = &updated.provider_conversation_id {
            inner.by_conversation.insert(conv.clone(), updated.id);
        }

        Self::append_event_locked(
            &mut inner,
            updated.id,
            transition.event,
            transition.at,
            updated.state,
        );
        inner.transactions.insert(updated.id, updated.clone());

        Ok(updated)
    }

    async fn append_note(
        &self,
        id: TransactionId,
        kind: EventKind,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let state =
            inner.transactions.get(&id).map(|tx| tx.state).ok_or(BridgeError::NotFound)?;
        Self::append_event_locked(&mut inner, id, kind, at, state);
        Ok(())
    }

    async fn list_expiring(&self, before: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let inner = self.inner.lock();
        Ok(inner
            .transactions
            .values()
            .filter(|tx| tx.state == TxState::LightningPending && tx.quote_expires_at <= before)
            .cloned()
            .collect())
    }

    async fn list_in_state_older_than(
        &self,
        state: TxState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let inner = self.inner.lock();
        Ok(inner
            .transactions
            .values()
            .filter(|tx| tx.state == state && tx.updated_at <= updated_before)
            .cloned()
            .collect())
    }

    async fn events(&self, id: TransactionId) -> Result<Vec<TransactionEvent>> {
        Ok(self.inner.lock().events.get(&id).cloned().unwrap_or_default())
    }

    async fn insert_receipt(&self, receipt: Receipt) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.receipts.contains_key(&receipt.tx_id) {
            // At most one receipt per transaction; re-issue is a no-op
            return Ok(());
        }
        inner.receipts.insert(receipt.tx_id, receipt);
        Ok(())
    }

    async fn get_receipt(&self, tx_id: TransactionId) -> Result<Option<Receipt>> {
        Ok(self.inner.lock().receipts.get(&tx_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::replay_state;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use sambaza_types::{ClientOrigin, KesAmount, Msisdn, SatAmount};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn sample_tx(hash_byte: &str, idem: Option<&str>) -> Transaction {
        let now = base_time();
        Transaction {
            id: TransactionId::new(),
            flow: Flow::SendMoney,
            payment_hash: PaymentHash::parse(&hash_byte.repeat(32)).unwrap(),
            recipient_phone: Msisdn::parse("254712345678").unwrap(),
            merchant_code: None,
            account_number: None,
            kes_amount: KesAmount::from_kes(1000),
            btc_amount: SatAmount::new(9000),
            rate: Decimal::new(11_500_000, 0),
            fee_kes: KesAmount::from_kes(25),
            state: TxState::Pending,
            created_at: now,
            updated_at: now,
            quote_expires_at: now + chrono::Duration::minutes(15),
            lightning_invoice: None,
            settled_at: None,
            mpesa_receipt: None,
            provider_conversation_id: None,
            failure: None,
            risk_score: None,
            idempotency_key: idem.map(str::to_string),
            origin: ClientOrigin::default(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_payment_hash() {
        let store = MemoryTransactionStore::new();
        store.create(sample_tx("ab", None)).await.unwrap();

        let err = store.create(sample_tx("ab", None)).await.unwrap_err();
        assert!(matches!(err, BridgeError::DuplicatePaymentHash));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_idempotency_key() {
        let store = MemoryTransactionStore::new();
        let first = store.create(sample_tx("ab", Some("k1"))).await.unwrap();

        let err = store.create(sample_tx("cd", Some("k1"))).await.unwrap_err();
        match err {
            BridgeError::DuplicateIdempotencyKey { existing } => assert_eq!(existing, first.id),
            other => panic!("expected DuplicateIdempotencyKey, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transition_enforces_version() {
        let store = MemoryTransactionStore::new();
        let tx = store.create(sample_tx("ab", None)).await.unwrap();
        let at = base_time() + chrono::Duration::seconds(1);

        let moved = store
            .transition(Transition::new(&tx, TxState::LightningPending, EventKind::InvoiceMinted, at))
            .await
            .unwrap();
        assert_eq!(moved.version, 1);
        assert_eq!(moved.state, TxState::LightningPending);

        // A second caller working from the stale snapshot loses
        let err = store
            .transition(Transition::new(&tx, TxState::Cancelled, EventKind::Cancelled, at))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::StaleVersion { .. }));
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_move() {
        let store = MemoryTransactionStore::new();
        let tx = store.create(sample_tx("ab", None)).await.unwrap();
        let at = base_time();

        let err = store
            .transition(Transition::new(
                &tx,
                TxState::Completed,
                EventKind::MpesaConfirmed { receipt: sambaza_types::MpesaReceipt("X".into()) },
                at,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::IllegalTransition { .. }));

        // State unchanged after the refused transition
        let unchanged = store.get(tx.id).await.unwrap();
        assert_eq!(unchanged.state, TxState::Pending);
        assert_eq!(unchanged.version, 0);
    }

    #[tokio::test]
    async fn test_receipt_without_completed_is_refused() {
        let store = MemoryTransactionStore::new();
        let tx = store.create(sample_tx("ab", None)).await.unwrap();
        let at = base_time();

        let err = store
            .transition(
                Transition::new(&tx, TxState::LightningPending, EventKind::InvoiceMinted, at)
                    .with_mutation(|t| {
                        t.mpesa_receipt = Some(sambaza_types::MpesaReceipt("MPE1".into()))
                    }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvariantViolation { .. }));
    }

    #[tokio::test]
    async fn test_ledger_is_gap_free_and_replayable() {
        let store = MemoryTransactionStore::new();
        let tx = store.create(sample_tx("ab", None)).await.unwrap();
        let at = base_time();

        let tx = store
            .transition(Transition::new(&tx, TxState::LightningPending, EventKind::InvoiceMinted, at))
            .await
            .unwrap();
        store
            .append_note(tx.id, EventKind::SettlementIgnored { reason: "test".into() }, at)
            .await
            .unwrap();
        let tx = store
            .transition(Transition::new(
                &tx,
                TxState::LightningPaid,
                EventKind::InvoiceSettled { amount_sats: SatAmount::new(9000) },
                at,
            ).with_mutation(move |t| t.settled_at = Some(at)))
            .await
            .unwrap();

        let events = store.events(tx.id).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(replay_state(&events), Some(TxState::LightningPaid));
        assert_eq!(replay_state(&events), Some(store.get(tx.id).await.unwrap().state));
    }

    #[tokio::test]
    async fn test_list_expiring_filters_by_state_and_time() {
        let store = MemoryTransactionStore::new();
        let tx = store.create(sample_tx("ab", None)).await.unwrap();
        let at = base_time();
        store
            .transition(Transition::new(&tx, TxState::LightningPending, EventKind::InvoiceMinted, at))
            .await
            .unwrap();

        let before_expiry = store.list_expiring(at + chrono::Duration::minutes(14)).await.unwrap();
        assert!(before_expiry.is_empty());

        let after_expiry = store.list_expiring(at + chrono::Duration::minutes(16)).await.unwrap();
        assert_eq!(after_expiry.len(), 1);
    }
}
