/// API request and response shapes
///
/// Inbound bodies are validated with `validator` before they reach the
/// orchestrator; responses are projections of the transaction aggregate.
/// The public API speaks whole KES and converts to cents at this boundary.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sambaza_errors::{BridgeError, Result};
use sambaza_types::{
    ClientOrigin, Flow, Msisdn, Transaction, TransactionEvent, TxState,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::orchestrator::NewPayment;

/// Body of every flow-create endpoint
#[derive(Debug, Deserialize, Validate)]
pub struct CreatePaymentRequest {
    /// Recipient MSISDN; normalised to 254XXXXXXXXX
    pub recipient_phone: String,
    /// Payout amount in whole KES
    #[validate(range(min = 1, max = 1_000_000))]
    pub kes_amount: i64,
    /// Till or paybill number, 5-7 digits where the flow requires it
    pub merchant_code: Option<String>,
    /// Account reference for PAYBILL
    #[validate(length(max = 64))]
    pub account_number: Option<String>,
    /// Client-supplied dedup key, scoped per flow
    #[validate(length(min = 1, max = 128))]
    pub idempotency_key: Option<String>,
}

impl CreatePaymentRequest {
    /// Validate and convert into orchestrator parameters.
    pub fn into_new_payment(self, flow: Flow, origin: ClientOrigin) -> Result<NewPayment> {
        self.validate()
            .map_err(|e| BridgeError::invalid_input(e.to_string()))?;

        let recipient_phone = Msisdn::parse(&self.recipient_phone)
            .map_err(BridgeError::invalid_input)?;

        Ok(NewPayment {
            flow,
            recipient_phone,
            merchant_code: self.merchant_code,
            account_number: self.account_number,
            kes_amount: sambaza_types::KesAmount::from_kes(self.kes_amount),
            idempotency_key: self.idempotency_key,
            origin,
        })
    }
}

/// Response for a created (or idempotently collapsed) payment
#[derive(Debug, Serialize, Deserialize)]
pub struct CreatePaymentResponse {
    pub tx_id: String,
    pub payment_hash: String,
    pub lightning_invoice: Option<String>,
    pub btc_amount_sats: i64,
    /// Whole KES, mirroring the request
    pub kes_amount: i64,
    pub rate: Decimal,
    pub fee_kes: i64,
    pub expires_at: DateTime<Utc>,
}

impl From<&Transaction> for CreatePaymentResponse {
    fn from(tx: &Transaction) -> Self {
        Self {
            tx_id: tx.id.to_string(),
            payment_hash: tx.payment_hash.as_str().to_string(),
            lightning_invoice: tx.lightning_invoice.as_ref().map(|i| i.0.clone()),
            btc_amount_sats: tx.btc_amount.sats(),
            kes_amount: tx.kes_amount.kes(),
            rate: tx.rate,
            fee_kes: tx.fee_kes.kes(),
            expires_at: tx.quote_expires_at,
        }
    }
}

/// GET /transactions/{payment_hash}
#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionStatusResponse {
    pub tx_id: String,
    pub state: TxState,
    pub kes_amount: i64,
    pub btc_amount_sats: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mpesa_receipt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Transaction> for TransactionStatusResponse {
    fn from(tx: &Transaction) -> Self {
        Self {
            tx_id: tx.id.to_string(),
            state: tx.state,
            kes_amount: tx.kes_amount.kes(),
            btc_amount_sats: tx.btc_amount.sats(),
            mpesa_receipt: tx.mpesa_receipt.as_ref().map(|r| r.0.clone()),
            failure_reason: tx.failure.as_ref().map(|f| f.reason.as_str().to_string()),
            failure_detail: tx.failure.as_ref().map(|f| f.detail.clone()),
            updated_at: tx.updated_at,
        }
    }
}

/// One entry of the audit ledger, as exposed by the events endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct EventResponse {
    pub seq: i64,
    pub kind: serde_json::Value,
    pub at: DateTime<Utc>,
    pub state: TxState,
}

impl From<&TransactionEvent> for EventResponse {
    fn from(event: &TransactionEvent) -> Self {
        Self {
            seq: event.seq,
            kind: serde_json::to_value(&event.kind).unwrap_or(serde_json::Value::Null),
            at: event.at,
            state: event.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreatePaymentRequest {
        CreatePaymentRequest {
            recipient_phone: "254712345678".to_string(),
            kes_amount: 1000,
            merchant_code: None,
            account_number: None,
            idempotency_key: Some("k1".to_string()),
        }
    }

    #[test]
    fn test_request_converts_to_cents() {
        let payment = request()
            .into_new_payment(Flow::SendMoney, ClientOrigin::default())
            .unwrap();
        assert_eq!(payment.kes_amount.cents(), 100_000);
        assert_eq!(payment.recipient_phone.as_str(), "254712345678");
    }

    #[test]
    fn test_request_rejects_bad_phone() {
        let mut bad = request();
        bad.recipient_phone = "12345".to_string();
        assert!(bad.into_new_payment(Flow::SendMoney, ClientOrigin::default()).is_err());
    }

    #[test]
    fn test_request_rejects_zero_amount() {
        let mut bad = request();
        bad.kes_amount = 0;
        assert!(bad.into_new_payment(Flow::SendMoney, ClientOrigin::default()).is_err());
    }
}
