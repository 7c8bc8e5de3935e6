/// The transaction aggregate and its event ledger
///
/// A transaction is an immutable snapshot between transitions: components
/// receive a copy, decide, and ask the store to commit a new state. Each
/// committed change appends a `TransactionEvent`, and replaying that ledger
/// from scratch reproduces the materialised row.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    Failure, Flow, KesAmount, LightningInvoice, Msisdn, MpesaReceipt, PaymentHash, SatAmount,
    TxState, TransactionId,
};

/// Where the create request came from, captured for deferred risk scoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClientOrigin {
    pub source_ip: String,
    pub user_agent: String,
}

/// The single aggregate root of the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub flow: Flow,
    /// Unique across the store; set at invoice creation, immutable after
    pub payment_hash: PaymentHash,
    pub recipient_phone: Msisdn,
    /// Till or paybill number; required for PAYBILL / BUY_GOODS only
    pub merchant_code: Option<String>,
    /// Free-form account reference; required for PAYBILL
    pub account_number: Option<String>,
    /// Payout amount, integer cents
    pub kes_amount: KesAmount,
    /// Inbound amount in satoshis, frozen by the quote engine
    pub btc_amount: SatAmount,
    /// BTC -> KES rate frozen at quote creation
    pub rate: Decimal,
    /// Service fee, integer cents
    pub fee_kes: KesAmount,
    pub state: TxState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the invoice and rate lock stop being honoured
    pub quote_expires_at: DateTime<Utc>,
    pub lightning_invoice: Option<LightningInvoice>,
    /// Set when the Lightning leg settles
    pub settled_at: Option<DateTime<Utc>>,
    /// Daraja receipt number; non-null exactly when state == COMPLETED
    pub mpesa_receipt: Option<MpesaReceipt>,
    /// Daraja conversation id from the synchronous dispatch ack
    pub provider_conversation_id: Option<String>,
    pub failure: Option<Failure>,
    /// 0.0 - 1.0, stamped by the risk engine before payout
    pub risk_score: Option<f64>,
    /// Client-supplied dedup key, unique per flow when present
    pub idempotency_key: Option<String>,
    pub origin: ClientOrigin,
    /// Optimistic concurrency counter, bumped on every mutation
    pub version: i64,
}

impl Transaction {
    /// True once the inbound sats are in our custody, which is the point
    /// after which every non-completion exit must go through a refund.
    pub fn lightning_settled(&self) -> bool {
        self.settled_at.is_some()
    }

    /// Total the payer is charged for, in KES cents.
    pub fn total_kes(&self) -> KesAmount {
        KesAmount::from_cents(self.kes_amount.cents() + self.fee_kes.cents())
    }
}

/// What a ledger entry records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Created,
    InvoiceMinted,
    InvoiceSettled { amount_sats: SatAmount },
    RiskEvaluated { score: f64, decision: RiskDecision },
    /// FLAG decisions proceed but leave a requires-review marker
    RequiresReview,
    MpesaDispatched { conversation_id: String },
    MpesaConfirmed { receipt: MpesaReceipt },
    MpesaFailed { result_code: i64, result_desc: String },
    ReceiptIssued { receipt_id: String },
    /// A settlement arrived for a transaction no longer waiting on one
    SettlementIgnored { reason: String },
    RefundStarted,
    RefundConfirmed,
    Expired,
    Cancelled,
    Failed { reason: String },
}

/// Immutable audit-trail entry, gap-free and monotonic in `seq` per tx
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub tx_id: TransactionId,
    pub seq: i64,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    /// State after this event was applied
    pub state: TxState,
}

/// Immutable receipt record, created on entry to COMPLETED
///
/// Rendering is deferred to request time and derived only from `payload`,
/// so re-renders are identical. The edge to the transaction is
/// unidirectional; lookups go through the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: uuid::Uuid,
    pub tx_id: TransactionId,
    pub payload: serde_json::Value,
    /// base64url-encoded, HMAC-signed verification payload
    pub qr_payload: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a risk evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskDecision {
    Allow,
    /// Proceeds, but the ledger records a requires-review marker
    Flag,
    /// Aborts before M-Pesa dispatch; refunds if Lightning already settled
    Block,
}

/// Score, contributing factors and the resulting decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub factors: Vec<String>,
    pub decision: RiskDecision,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_tx() -> Transaction {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        Transaction {
            id: TransactionId::new(),
            flow: Flow::SendMoney,
            payment_hash: PaymentHash::parse(&"ab".repeat(32)).unwrap(),
            recipient_phone: Msisdn::parse("254712345678").unwrap(),
            merchant_code: None,
            account_number: None,
            kes_amount: KesAmount::from_kes(1000),
            btc_amount: SatAmount::new(9_000),
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
            idempotency_key: Some("k1".to_string()),
            origin: ClientOrigin::default(),
            version: 0,
        }
    }

    #[test]
    fn test_total_includes_fee() {
        let tx = sample_tx();
        assert_eq!(tx.total_kes(), KesAmount::from_kes(1025));
    }

    #[test]
    fn test_settlement_marker() {
        let mut tx = sample_tx();
        assert!(!tx.lightning_settled());
        tx.settled_at = Some(tx.created_at + chrono::Duration::minutes(1));
        assert!(tx.lightning_settled());
    }

    #[test]
    fn test_event_kind_serialises_tagged() {
        let kind = EventKind::MpesaConfirmed { receipt: MpesaReceipt("MPE123".to_string()) };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["kind"], "mpesa_confirmed");
        assert_eq!(json["receipt"], "MPE123");
    }
}
