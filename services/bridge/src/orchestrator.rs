/// Transaction orchestrator
///
/// Drives every transaction through quote -> invoice -> settle -> convert
/// -> payout -> receipt, consuming settlement and callback events and
/// enforcing the state graph. Per-transaction work is serialised through
/// striped locks; across transactions everything runs in parallel.

use chrono::{DateTime, Duration, Utc};
use sambaza_errors::{BridgeError, Result};
use sambaza_types::{
    ClientOrigin, EventKind, Failure, FailureReason, Flow, KesAmount, Msisdn, PaymentHash,
    RiskDecision, SatAmount, Transaction, TransactionId, TxState,
};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::idempotency::{IdempotencyIndex, Reservation};
use crate::lightning::LightningNode;
use crate::mpesa::{MpesaGateway, MpesaResult};
use crate::quote;
use crate::rates::RateProvider;
use crate::receipt::ReceiptGenerator;
use crate::retry::{retry, RetryPolicy};
use crate::store::{TransactionStore, Transition};

const LOCK_STRIPES: usize = 64;

/// How a Daraja callback is correlated back to its transaction
#[derive(Debug, Clone)]
pub enum MpesaCorrelation {
    /// Leading 12 hex of the payment hash, echoed in the account
    /// reference slot
    AccountReference(String),
    /// Conversation id recorded at dispatch time
    ConversationId(String),
}

/// Events consumed by the orchestrator. Webhooks and the settlement
/// subscription only ever translate into these; they never touch state.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    InvoiceSettled {
        payment_hash: PaymentHash,
        amount_sats: SatAmount,
        settled_at: DateTime<Utc>,
        /// Node-side sequence number when the event came off the
        /// subscription stream
        seq: Option<u64>,
    },
    MpesaResult {
        correlation: MpesaCorrelation,
        result: MpesaResult,
    },
}

/// Validated parameters for a create request
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub flow: Flow,
    pub recipient_phone: Msisdn,
    pub merchant_code: Option<String>,
    pub account_number: Option<String>,
    pub kes_amount: KesAmount,
    pub idempotency_key: Option<String>,
    pub origin: ClientOrigin,
}

/// Per-transaction serialisation: one mutex per stripe, keyed by tx id
struct StripedLocks {
    stripes: Vec<tokio::sync::Mutex<()>>,
}

impl StripedLocks {
    fn new(count: usize) -> Self {
        Self { stripes: (0..count).map(|_| tokio::sync::Mutex::new(())).collect() }
    }

    async fn lock(&self, id: TransactionId) -> tokio::sync::MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[index].lock().await
    }
}

pub struct Orchestrator {
    store: Arc<dyn TransactionStore>,
    lightning: Arc<dyn LightningNode>,
    mpesa: Arc<dyn MpesaGateway>,
    risk: Arc<crate::risk::RiskEngine>,
    receipts: Arc<ReceiptGenerator>,
    idempotency: Arc<IdempotencyIndex>,
    rates: Arc<RateProvider>,
    clock: SharedClock,
    locks: StripedLocks,
    /// Last settlement sequence number acked to the node subscription
    last_acked_seq: AtomicU64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TransactionStore>,
        lightning: Arc<dyn LightningNode>,
        mpesa: Arc<dyn MpesaGateway>,
        risk: Arc<crate::risk::RiskEngine>,
        receipts: Arc<ReceiptGenerator>,
        idempotency: Arc<IdempotencyIndex>,
        rates: Arc<RateProvider>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            lightning,
            mpesa,
            risk,
            receipts,
            idempotency,
            rates,
            clock,
            locks: StripedLocks::new(LOCK_STRIPES),
            last_acked_seq: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    pub fn rates(&self) -> &Arc<RateProvider> {
        &self.rates
    }

    pub fn receipts(&self) -> &Arc<ReceiptGenerator> {
        &self.receipts
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyIndex> {
        &self.idempotency
    }

    pub fn risk(&self) -> &Arc<crate::risk::RiskEngine> {
        &self.risk
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn last_acked_seq(&self) -> u64 {
        self.last_acked_seq.load(Ordering::SeqCst)
    }

    pub fn ack_seq(&self, seq: u64) {
        self.last_acked_seq.fetch_max(seq, Ordering::SeqCst);
    }

    fn log_transition(&self, tx: &Transaction, from: TxState) {
        sambaza_tracing::log_transition(
            &tx.id.to_string(),
            tx.payment_hash.as_str(),
            tx.flow.as_str(),
            from.as_str(),
            tx.state.as_str(),
            tx.kes_amount.cents(),
        );
    }

    /// Commit a transition, absorbing one StaleVersion by reloading.
    async fn commit(
        &self,
        tx: &Transaction,
        new_state: TxState,
        event: EventKind,
        mutate: Option<Arc<dyn Fn(&mut Transaction) + Send + Sync>>,
    ) -> Result<Transaction> {
        let at = self.clock.now();
        let mut transition = Transition::new(tx, new_state, event.clone(), at);
        if let Some(mutate) = mutate.clone() {
            transition.mutate = Some(Box::new(move |t| mutate(t)));
        }

        let updated = match self.store.transition(transition).await {
            Ok(updated) => updated,
            Err(BridgeError::StaleVersion { id }) => {
                // One local retry from a fresh snapshot; a second loss
                // means a concurrent actor owns this transaction.
                let fresh = self.store.get(id).await?;
                if fresh.state != tx.state {
                    return Err(BridgeError::StaleVersion { id });
                }
                let mut retry_transition =
                    Transition::new(&fresh, new_state, event, self.clock.now());
                if let Some(mutate) = mutate {
                    retry_transition.mutate = Some(Box::new(move |t| mutate(t)));
                }
                self.store.transition(retry_transition).await?
            }
            Err(err) => return Err(err),
        };

        self.log_transition(&updated, tx.state);
        if updated.state.is_terminal() {
            self.idempotency.mark_terminal(updated.id, at);
        }
        Ok(updated)
    }

    /// Create a transaction: idempotency check, quote lock, invoice mint.
    pub async fn create_payment(&self, params: NewPayment) -> Result<Transaction> {
        validate_flow_fields(&params)?;
        quote::check_limits(params.flow, params.kes_amount)?;

        // Idempotent collapse: a retried create returns the original
        // transaction and never mints a second invoice.
        if let Some(key) = &params.idempotency_key {
            if let Some(existing) =
                self.store.find_by_idempotency_key(params.flow, key).await?
            {
                tracing::info!(tx_id = %existing.id, key = key, "idempotent create collapsed");
                return Ok(existing);
            }
        }

        let provisional_id = TransactionId::new();
        if let Some(key) = &params.idempotency_key {
            if let Reservation::Existing(winner) =
                self.idempotency.reserve(params.flow, key, provisional_id)
            {
                return Ok(self.store.get(winner).await?);
            }
        }

        let outcome = self.create_payment_inner(provisional_id, &params).await;
        if outcome.is_err() {
            if let Some(key) = &params.idempotency_key {
                self.idempotency.release(params.flow, key, provisional_id);
            }
        }
        outcome
    }

    async fn create_payment_inner(
        &self,
        id: TransactionId,
        params: &NewPayment,
    ) -> Result<Transaction> {
        let now = self.clock.now();
        let rate_quote = self.rates.current()?;
        let locked = quote::quote(params.flow, params.kes_amount, &rate_quote, now)?;

        let memo = format!("Sambaza {} {}", params.flow.as_str(), params.recipient_phone);
        let expires_in = std::time::Duration::from_secs(
            (quote::QUOTE_WINDOW_MINUTES * 60) as u64,
        );
        let lightning = self.lightning.clone();
        let amount = locked.btc_sats;
        let invoice = retry(RetryPolicy::invoice_creation(), "create_invoice", || {
            let memo = memo.clone();
            let lightning = lightning.clone();
            async move { lightning.create_invoice(amount, &memo, expires_in).await }
        })
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "invoice creation exhausted its retry budget");
            err
        })?;

        let tx = Transaction {
            id,
            flow: params.flow,
            payment_hash: invoice.payment_hash.clone(),
            recipient_phone: params.recipient_phone.clone(),
            merchant_code: params.merchant_code.clone(),
            account_number: params.account_number.clone(),
            kes_amount: params.kes_amount,
            btc_amount: locked.btc_sats,
            rate: locked.rate,
            fee_kes: locked.fee_kes,
            state: TxState::Pending,
            created_at: now,
            updated_at: now,
            quote_expires_at: locked.valid_until,
            lightning_invoice: None,
            settled_at: None,
            mpesa_receipt: None,
            provider_conversation_id: None,
            failure: None,
            risk_score: None,
            idempotency_key: params.idempotency_key.clone(),
            origin: params.origin.clone(),
            version: 0,
        };

        let tx = match self.store.create(tx).await {
            Ok(tx) => tx,
            Err(BridgeError::DuplicateIdempotencyKey { existing }) => {
                // Lost a race with a concurrent identical create
                return Ok(self.store.get(existing).await?);
            }
            Err(err) => return Err(err),
        };

        self.risk.observe_created(&tx);

        let payment_request = invoice.payment_request.clone();
        let tx = self
            .commit(
                &tx,
                TxState::LightningPending,
                EventKind::InvoiceMinted,
                Some(Arc::new(move |t| t.lightning_invoice = Some(payment_request.clone()))),
            )
            .await?;

        Ok(tx)
    }

    /// Apply one inbound event. Entry point for the event worker.
    pub async fn handle_event(&self, event: OrchestratorEvent) -> Result<()> {
        match event {
            OrchestratorEvent::InvoiceSettled { payment_hash, amount_sats, settled_at, seq } => {
                if let Some(seq) = seq {
                    self.ack_seq(seq);
                }
                self.handle_settlement(payment_hash, amount_sats, settled_at).await
            }
            OrchestratorEvent::MpesaResult { correlation, result } => {
                self.handle_mpesa_result(correlation, result).await
            }
        }
    }

    async fn handle_settlement(
        &self,
        payment_hash: PaymentHash,
        amount_sats: SatAmount,
        settled_at: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.store.get_by_payment_hash(&payment_hash).await?;
        let _guard = self.locks.lock(tx.id).await;
        let tx = self.store.get(tx.id).await?;
        let now = self.clock.now();

        match tx.state {
            TxState::LightningPending if now >= tx.quote_expires_at => {
                // The sweeper owns this move, but a settlement racing the
                // sweep must not resurrect an expired quote.
                let tx = self.commit(&tx, TxState::Expired, EventKind::Expired, None).await?;
                self.store
                    .append_note(
                        tx.id,
                        EventKind::SettlementIgnored {
                            reason: "settled after quote expiry".to_string(),
                        },
                        now,
                    )
                    .await?;
                tracing::warn!(tx_id = %tx.id, "settlement arrived after quote expiry");
                Ok(())
            }
            TxState::LightningPending => {
                if amount_sats < tx.btc_amount {
                    tracing::warn!(
                        tx_id = %tx.id,
                        expected = tx.btc_amount.sats(),
                        received = amount_sats.sats(),
                        "settlement below invoice amount"
                    );
                }
                let tx = self
                    .commit(
                        &tx,
                        TxState::LightningPaid,
                        EventKind::InvoiceSettled { amount_sats },
                        Some(Arc::new(move |t| t.settled_at = Some(settled_at))),
                    )
                    .await?;
                self.evaluate_and_dispatch(tx).await
            }
            TxState::Expired => {
                self.store
                    .append_note(
                        tx.id,
                        EventKind::SettlementIgnored { reason: "transaction expired".to_string() },
                        now,
                    )
                    .await?;
                tracing::warn!(tx_id = %tx.id, "stale settlement for expired transaction");
                Ok(())
            }
            _ => {
                // Duplicate delivery after we already advanced; nothing to do
                tracing::debug!(tx_id = %tx.id, state = %tx.state, "duplicate settlement ignored");
                Ok(())
            }
        }
    }

    /// Risk gate and payout dispatch, from LIGHTNING_PAID.
    async fn evaluate_and_dispatch(&self, tx: Transaction) -> Result<()> {
        let now = self.clock.now();
        let assessment = self.risk.score(&tx, now);
        let score = assessment.score;

        tracing::info!(
            tx_id = %tx.id,
            score = score,
            decision = ?assessment.decision,
            factors = ?assessment.factors,
            "risk evaluated"
        );

        match assessment.decision {
            RiskDecision::Block => {
                let tx = self
                    .commit(
                        &tx,
                        TxState::Refunding,
                        EventKind::RiskEvaluated { score, decision: RiskDecision::Block },
                        Some(Arc::new(move |t| {
                            t.risk_score = Some(score);
                            t.failure = Some(Failure::new(
                                FailureReason::RiskBlocked,
                                "blocked by risk policy before payout",
                            ));
                        })),
                    )
                    .await?;
                self.attempt_refund(tx).await
            }
            decision => {
                let tx = self
                    .commit(
                        &tx,
                        TxState::Converting,
                        EventKind::RiskEvaluated { score, decision },
                        Some(Arc::new(move |t| t.risk_score = Some(score))),
                    )
                    .await?;
                if decision == RiskDecision::Flag {
                    self.store.append_note(tx.id, EventKind::RequiresReview, now).await?;
                }
                self.dispatch_payout(tx).await
            }
        }
    }

    /// Dispatch the Daraja operation, from CONVERTING.
    async fn dispatch_payout(&self, tx: Transaction) -> Result<()> {
        let mpesa = self.mpesa.clone();
        let dispatch_tx = tx.clone();
        let outcome = retry(RetryPolicy::side_effect(), "mpesa_dispatch", || {
            let mpesa = mpesa.clone();
            let tx = dispatch_tx.clone();
            async move { mpesa.dispatch(&tx).await }
        })
        .await;

        match outcome {
            Ok(outcome) if outcome.accepted => {
                let conversation_id = outcome.conversation_id.clone();
                self.commit(
                    &tx,
                    TxState::MpesaPending,
                    EventKind::MpesaDispatched { conversation_id: outcome.conversation_id },
                    Some(Arc::new(move |t| {
                        t.provider_conversation_id = Some(conversation_id.clone())
                    })),
                )
                .await?;
                Ok(())
            }
            Ok(outcome) => {
                self.fail_and_refund(
                    tx,
                    FailureReason::DarajaRejected,
                    format!("dispatch not accepted: {}", outcome.description),
                )
                .await
            }
            Err(err) => {
                let reason = if err.is_transient() {
                    FailureReason::UpstreamExhausted
                } else {
                    FailureReason::DarajaRejected
                };
                self.fail_and_refund(tx, reason, err.user_message()).await
            }
        }
    }

    async fn handle_mpesa_result(
        &self,
        correlation: MpesaCorrelation,
        result: MpesaResult,
    ) -> Result<()> {
        let tx = match &correlation {
            MpesaCorrelation::AccountReference(reference) => {
                self.store.get_by_payment_hash_prefix(reference).await?
            }
            MpesaCorrelation::ConversationId(id) => {
                self.store.get_by_conversation_id(id).await?
            }
        };

        let _guard = self.locks.lock(tx.id).await;
        let tx = self.store.get(tx.id).await?;
        let now = self.clock.now();

        if tx.state != TxState::MpesaPending {
            tracing::debug!(
                tx_id = %tx.id,
                state = %tx.state,
                "callback for transaction not awaiting M-Pesa, ignored"
            );
            return Ok(());
        }

        if result.succeeded() {
            let receipt = result.receipt.clone().ok_or_else(|| {
                BridgeError::InvariantViolation {
                    message: "successful Daraja result without a receipt number".to_string(),
                }
            })?;
            let receipt_for_mutation = receipt.clone();
            let tx = self
                .commit(
                    &tx,
                    TxState::Completed,
                    EventKind::MpesaConfirmed { receipt },
                    Some(Arc::new(move |t| t.mpesa_receipt = Some(receipt_for_mutation.clone()))),
                )
                .await?;
            self.issue_receipt(&tx, now).await
        } else {
            let result_desc = result.result_desc.clone();
            let tx = self
                .commit(
                    &tx,
                    TxState::Failed,
                    EventKind::MpesaFailed {
                        result_code: result.result_code,
                        result_desc: result.result_desc.clone(),
                    },
                    Some(Arc::new(move |t| {
                        t.failure = Some(Failure::new(
                            FailureReason::DarajaResultError,
                            result_desc.clone(),
                        ))
                    })),
                )
                .await?;
            self.begin_refund(tx).await
        }
    }

    async fn issue_receipt(&self, tx: &Transaction, at: DateTime<Utc>) -> Result<()> {
        if self.store.get_receipt(tx.id).await?.is_some() {
            // Crash between COMPLETED and the note replays into here
            return Ok(());
        }
        let receipt = self.receipts.generate(tx, at)?;
        let receipt_id = receipt.id.to_string();
        self.store.insert_receipt(receipt).await?;
        self.store.append_note(tx.id, EventKind::ReceiptIssued { receipt_id }, at).await?;
        Ok(())
    }

    async fn fail_and_refund(
        &self,
        tx: Transaction,
        reason: FailureReason,
        detail: String,
    ) -> Result<()> {
        let tx = self
            .commit(
                &tx,
                TxState::Failed,
                EventKind::Failed { reason: reason.as_str().to_string() },
                Some(Arc::new(move |t| {
                    t.failure = Some(Failure { reason, detail: detail.clone() })
                })),
            )
            .await?;
        self.begin_refund(tx).await
    }

    /// FAILED -> REFUNDING, for transactions whose Lightning leg settled.
    async fn begin_refund(&self, tx: Transaction) -> Result<()> {
        if !tx.lightning_settled() {
            // No inbound funds are held; FAILED is already the end of the
            // road and the record stays there for the audit trail.
            return Ok(());
        }
        let tx = self.commit(&tx, TxState::Refunding, EventKind::RefundStarted, None).await?;
        self.attempt_refund(tx).await
    }

    /// Push the settled sats back to the payer, from REFUNDING.
    pub async fn attempt_refund(&self, tx: Transaction) -> Result<()> {
        let lightning = self.lightning.clone();
        let hash = tx.payment_hash.clone();
        let amount = tx.btc_amount;
        let outcome = retry(RetryPolicy::side_effect(), "lightning_refund", || {
            let lightning = lightning.clone();
            let hash = hash.clone();
            async move { lightning.refund(&hash, amount).await }
        })
        .await;

        match outcome {
            Ok(()) => {
                self.commit(&tx, TxState::Refunded, EventKind::RefundConfirmed, None).await?;
                Ok(())
            }
            Err(err) => {
                // Stay in REFUNDING; the reconciler retries stuck refunds.
                tracing::error!(tx_id = %tx.id, error = %err, "refund attempt failed");
                Ok(())
            }
        }
    }

    /// Client cancellation, allowed only before settlement.
    pub async fn cancel(&self, payment_hash: &PaymentHash) -> Result<Transaction> {
        let tx = self.store.get_by_payment_hash(payment_hash).await?;
        let _guard = self.locks.lock(tx.id).await;
        let tx = self.store.get(tx.id).await?;

        match tx.state {
            TxState::Pending => {
                self.commit(&tx, TxState::Cancelled, EventKind::Cancelled, None).await
            }
            TxState::LightningPending => {
                if let Err(err) = self.lightning.cancel_invoice(&tx.payment_hash).await {
                    tracing::warn!(tx_id = %tx.id, error = %err, "invoice cancel failed");
                }
                self.commit(&tx, TxState::Cancelled, EventKind::Cancelled, None).await
            }
            _ => Err(BridgeError::invalid_input(
                "transaction can no longer be cancelled",
            )),
        }
    }

    /// Move stale LIGHTNING_PENDING rows to EXPIRED. Called by the sweeper.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let expiring = self.store.list_expiring(now).await?;
        let mut swept = 0;

        for stale in expiring {
            let _guard = self.locks.lock(stale.id).await;
            let tx = self.store.get(stale.id).await?;
            if tx.state != TxState::LightningPending || now < tx.quote_expires_at {
                continue;
            }
            if let Err(err) = self.lightning.cancel_invoice(&tx.payment_hash).await {
                tracing::debug!(tx_id = %tx.id, error = %err, "invoice cancel on expiry failed");
            }
            self.commit(&tx, TxState::Expired, EventKind::Expired, None).await?;
            swept += 1;
        }

        if swept > 0 {
            tracing::info!(count = swept, "expired stale transactions");
        }
        Ok(swept)
    }

    /// Re-query Daraja for payouts whose callback never arrived, and retry
    /// stuck refunds. Called by the reconciler loop.
    pub async fn reconcile(&self) -> Result<()> {
        let now = self.clock.now();

        let stuck_payouts = self
            .store
            .list_in_state_older_than(TxState::MpesaPending, now - Duration::minutes(2))
            .await?;
        for tx in stuck_payouts {
            match self.mpesa.query_status(&tx).await {
                Ok(Some(result)) => {
                    let correlation = MpesaCorrelation::ConversationId(
                        result.conversation_id.clone(),
                    );
                    if let Err(err) = self.handle_mpesa_result(correlation, result).await {
                        tracing::error!(tx_id = %tx.id, error = %err, "reconciliation failed");
                    }
                }
                Ok(None) => {
                    tracing::debug!(tx_id = %tx.id, "payout still in flight at Daraja");
                }
                Err(err) => {
                    tracing::warn!(tx_id = %tx.id, error = %err, "status query failed");
                }
            }
        }

        let stuck_refunds = self
            .store
            .list_in_state_older_than(TxState::Refunding, now - Duration::minutes(2))
            .await?;
        for tx in stuck_refunds {
            let _guard = self.locks.lock(tx.id).await;
            let tx = self.store.get(tx.id).await?;
            if tx.state == TxState::Refunding {
                if let Err(err) = self.attempt_refund(tx).await {
                    tracing::error!(error = %err, "refund retry failed");
                }
            }
        }

        Ok(())
    }
}

fn validate_flow_fields(params: &NewPayment) -> Result<()> {
    if params.flow.requires_merchant_code() {
        match params.merchant_code.as_deref() {
            Some(code) if (5..=7).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_digit()) => {}
            Some(_) => {
                return Err(BridgeError::invalid_input("merchant_code must be 5-7 digits"))
            }
            None => {
                return Err(BridgeError::invalid_input(format!(
                    "{} requires a merchant_code",
                    params.flow
                )))
            }
        }
    } else if params.merchant_code.is_some() {
        return Err(BridgeError::invalid_input(format!(
            "{} does not accept a merchant_code",
            params.flow
        )));
    }

    if params.flow.requires_account_number() && params.account_number.is_none() {
        return Err(BridgeError::invalid_input("PAYBILL requires an account_number"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(flow: Flow) -> NewPayment {
        NewPayment {
            flow,
            recipient_phone: Msisdn::parse("254712345678").unwrap(),
            merchant_code: None,
            account_number: None,
            kes_amount: KesAmount::from_kes(1000),
            idempotency_key: None,
            origin: ClientOrigin::default(),
        }
    }

    #[test]
    fn test_merchant_code_required_for_paybill() {
        let mut p = params(Flow::Paybill);
        p.account_number = Some("ACC-1".to_string());
        assert!(validate_flow_fields(&p).is_err());

        p.merchant_code = Some("123456".to_string());
        assert!(validate_flow_fields(&p).is_ok());

        p.merchant_code = Some("12".to_string());
        assert!(validate_flow_fields(&p).is_err());
    }

    #[test]
    fn test_merchant_code_forbidden_for_send_money() {
        let mut p = params(Flow::SendMoney);
        p.merchant_code = Some("123456".to_string());
        assert!(validate_flow_fields(&p).is_err());
    }

    #[test]
    fn test_paybill_needs_account_number() {
        let mut p = params(Flow::Paybill);
        p.merchant_code = Some("123456".to_string());
        assert!(validate_flow_fields(&p).is_err());

        p.account_number = Some("INV-001".to_string());
        assert!(validate_flow_fields(&p).is_ok());
    }

    #[test]
    fn test_buy_goods_takes_no_account_number() {
        let mut p = params(Flow::BuyGoods);
        p.merchant_code = Some("54321".to_string());
        assert!(validate_flow_fields(&p).is_ok());
    }
}
