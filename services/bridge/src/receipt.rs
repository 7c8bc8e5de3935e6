/// Receipt generator
///
/// On entry to COMPLETED an immutable receipt record is written. Rendering
/// is deferred to request time and derived only from the stored payload,
/// so re-renders are byte-identical. The QR payload is a base64url JSON
/// blob signed with HMAC-SHA256; verifiers check authenticity offline
/// without contacting the bridge.

use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sambaza_errors::{BridgeError, Result};
use sambaza_types::{Receipt, Transaction, TxState};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const B64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// The signed portion of the QR code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrClaims {
    pub receipt_id: Uuid,
    pub payment_hash: String,
    /// Amount plus service fee, KES cents
    pub total_kes: i64,
    /// Completion timestamp, unix seconds
    pub ts: i64,
}

pub struct ReceiptGenerator {
    hmac_secret: Vec<u8>,
}

impl ReceiptGenerator {
    pub fn new(hmac_secret: &str) -> Self {
        Self { hmac_secret: hmac_secret.as_bytes().to_vec() }
    }

    /// Build the receipt record for a completed transaction.
    pub fn generate(&self, tx: &Transaction, at: DateTime<Utc>) -> Result<Receipt> {
        if tx.state != TxState::Completed {
            return Err(BridgeError::InvariantViolation {
                message: format!("receipt requested for transaction in state {}", tx.state),
            });
        }
        let mpesa_receipt = tx.mpesa_receipt.as_ref().ok_or_else(|| {
            BridgeError::InvariantViolation {
                message: "completed transaction without mpesa_receipt".to_string(),
            }
        })?;

        let receipt_id = Uuid::new_v4();
        let claims = QrClaims {
            receipt_id,
            payment_hash: tx.payment_hash.as_str().to_string(),
            total_kes: tx.total_kes().cents(),
            ts: at.timestamp(),
        };

        let payload = serde_json::json!({
            "receipt_id": receipt_id,
            "tx_id": tx.id,
            "flow": tx.flow,
            "recipient_phone": tx.recipient_phone,
            "kes_amount": tx.kes_amount.cents(),
            "fee_kes": tx.fee_kes.cents(),
            "total_kes": tx.total_kes().cents(),
            "btc_amount_sats": tx.btc_amount.sats(),
            "rate": tx.rate,
            "mpesa_receipt": mpesa_receipt,
            "payment_hash": tx.payment_hash,
            "completed_at": at,
        });

        Ok(Receipt {
            id: receipt_id,
            tx_id: tx.id,
            payload,
            qr_payload: self.sign(&claims)?,
            created_at: at,
        })
    }

    /// `base64url(claims).base64url(hmac)` so verification needs only the
    /// shared secret.
    fn sign(&self, claims: &QrClaims) -> Result<String> {
        let body = serde_json::to_vec(claims)
            .map_err(|e| BridgeError::Internal(anyhow::Error::new(e)))?;
        let encoded = B64.encode(&body);

        let mut mac = HmacSha256::new_from_slice(&self.hmac_secret)
            .map_err(|e| BridgeError::Internal(anyhow::anyhow!("hmac key: {e}")))?;
        mac.update(encoded.as_bytes());
        let tag = B64.encode(mac.finalize().into_bytes());

        Ok(format!("{encoded}.{tag}"))
    }

    /// Verify a scanned QR payload and return its claims.
    pub fn verify(&self, qr_payload: &str) -> Result<QrClaims> {
        let (encoded, tag) = qr_payload
            .split_once('.')
            .ok_or_else(|| BridgeError::invalid_input("malformed receipt QR payload"))?;

        let mut mac = HmacSha256::new_from_slice(&self.hmac_secret)
            .map_err(|e| BridgeError::Internal(anyhow::anyhow!("hmac key: {e}")))?;
        mac.update(encoded.as_bytes());
        let tag_bytes = B64
            .decode(tag)
            .map_err(|_| BridgeError::invalid_input("malformed receipt QR signature"))?;
        mac.verify_slice(&tag_bytes)
            .map_err(|_| BridgeError::invalid_input("receipt QR signature mismatch"))?;

        let body = B64
            .decode(encoded)
            .map_err(|_| BridgeError::invalid_input("malformed receipt QR payload"))?;
        serde_json::from_slice(&body)
            .map_err(|_| BridgeError::invalid_input("malformed receipt QR claims"))
    }

    /// Deterministic HTML render of a stored receipt.
    pub fn render_html(receipt: &Receipt) -> String {
        let p = &receipt.payload;
        let field = |key: &str| p.get(key).cloned().unwrap_or(serde_json::Value::Null);
        let money = |key: &str| {
            let cents = field(key).as_i64().unwrap_or(0);
            format!("KES {}.{:02}", cents / 100, (cents % 100).abs())
        };

        format!(
            "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Sambaza receipt {id}</title></head>\n\
             <body>\n<h1>Payment receipt</h1>\n\
             <table>\n\
             <tr><td>Receipt</td><td>{id}</td></tr>\n\
             <tr><td>Flow</td><td>{flow}</td></tr>\n\
             <tr><td>Recipient</td><td>{phone}</td></tr>\n\
             <tr><td>Amount</td><td>{amount}</td></tr>\n\
             <tr><td>Service fee</td><td>{fee}</td></tr>\n\
             <tr><td>Total</td><td>{total}</td></tr>\n\
             <tr><td>Paid</td><td>{sats} sats</td></tr>\n\
             <tr><td>M-Pesa receipt</td><td>{mpesa}</td></tr>\n\
             <tr><td>Completed</td><td>{completed}</td></tr>\n\
             </table>\n\
             <p>Verification code:</p>\n<pre>{qr}</pre>\n\
             </body>\n</html>\n",
            id = receipt.id,
            flow = field("flow").as_str().unwrap_or(""),
            phone = field("recipient_phone").as_str().unwrap_or(""),
            amount = money("kes_amount"),
            fee = money("fee_kes"),
            total = money("total_kes"),
            sats = field("btc_amount_sats").as_i64().unwrap_or(0),
            mpesa = field("mpesa_receipt").as_str().unwrap_or(""),
            completed = field("completed_at").as_str().unwrap_or(""),
            qr = receipt.qr_payload,
        )
    }
}
