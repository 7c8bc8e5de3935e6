/// Webhook ingress
///
/// Two inbound surfaces: Lightning settlement notifications and Daraja
/// callbacks. Each handler authenticates the caller, extracts the
/// correlating key, drops duplicates against a 24 hour sliding window,
/// and enqueues an orchestrator event. Handlers never transition state
/// themselves; they are translators.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::Json,
};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sambaza_errors::{BridgeError, Result};
use sambaza_types::{MpesaReceipt, PaymentHash, SatAmount};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::mpesa::MpesaResult;
use crate::orchestrator::{MpesaCorrelation, OrchestratorEvent};
use crate::AppState;

const DEDUP_WINDOW_HOURS: i64 = 24;

/// Sliding window of webhook tokens already accepted
///
/// Duplicates are acknowledged with 200 but never dispatched. The GC
/// sweeper expires entries past the window.
#[derive(Default)]
pub struct DedupWindow {
    seen: Mutex<HashMap<[u8; 32], DateTime<Utc>>>,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token over the identifying parts of a delivery.
    pub fn token(endpoint: &str, conversation_id: &str, result_code: i64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(endpoint.as_bytes());
        hasher.update([0u8]);
        hasher.update(conversation_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(result_code.to_be_bytes());
        hasher.finalize().into()
    }

    /// Record the token; false means it was already present.
    pub fn check_and_insert(&self, token: [u8; 32], now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains_key(&token) {
            return false;
        }
        seen.insert(token, now);
        true
    }

    pub fn expire(&self, now: DateTime<Utc>) -> usize {
        let window = Duration::hours(DEDUP_WINDOW_HOURS);
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, at| now - *at <= window);
        before - seen.len()
    }
}

/// Simple IPv4 CIDR allowlist for the Daraja callback source addresses
pub fn ip_allowed(cidrs: &[String], ip: &str) -> bool {
    let Some(addr) = parse_ipv4(ip) else { return false };
    cidrs.iter().any(|cidr| {
        let Some((net, len)) = cidr.split_once('/') else {
            return parse_ipv4(cidr) == Some(addr);
        };
        let (Some(net), Ok(len)) = (parse_ipv4(net), len.parse::<u32>()) else {
            return false;
        };
        if len > 32 {
            return false;
        }
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        addr & mask == net & mask
    })
}

fn parse_ipv4(s: &str) -> Option<u32> {
    let mut parts = s.trim().split('.');
    let mut addr: u32 = 0;
    for _ in 0..4 {
        let octet: u32 = parts.next()?.parse().ok()?;
        if octet > 255 {
            return None;
        }
        addr = (addr << 8) | octet;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(addr)
}

/// Client address as seen through the proxy chain
fn source_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|chain| chain.split(',').next())
        .map(|ip| ip.trim().to_string())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}

/// Lightning settlement notification body
#[derive(Debug, Deserialize)]
pub struct LightningSettlementBody {
    pub payment_hash: String,
    pub settled_at: DateTime<Utc>,
    pub amount_sats: i64,
}

/// Acknowledgement shape shared with Daraja
fn ack_ok() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ResultCode": 0, "ResultDesc": "ok" }))
}

fn ack_malformed(desc: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ResultCode": 1, "ResultDesc": desc }))
}

/// POST /webhooks/lightning
///
/// Body is authenticated with X-Signature = HMAC-SHA256(body, secret).
pub async fn lightning_settlement(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let signature = headers
        .get("x-signature")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| BridgeError::WebhookRejected { message: "missing signature".into() })?;
    verify_signature(&state.config.webhooks.lightning_secret, &body, signature)?;

    let parsed: LightningSettlementBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(_) => return Ok(ack_malformed("unparseable body")),
    };
    let payment_hash = match PaymentHash::parse(&parsed.payment_hash) {
        Ok(hash) => hash,
        Err(_) => return Ok(ack_malformed("bad payment_hash")),
    };

    let token = DedupWindow::token("lightning", payment_hash.as_str(), 0);
    if !state.dedup.check_and_insert(token, state.clock.now()) {
        tracing::info!(payment_hash = %payment_hash, "duplicate settlement webhook dropped");
        return Ok(ack_ok());
    }

    let event = OrchestratorEvent::InvoiceSettled {
        payment_hash,
        amount_sats: SatAmount::new(parsed.amount_sats),
        settled_at: parsed.settled_at,
        seq: None,
    };
    if state.events.send(event).await.is_err() {
        return Err(BridgeError::Internal(anyhow::anyhow!("event queue closed")));
    }

    Ok(ack_ok())
}

fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> Result<()> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| BridgeError::Internal(anyhow::anyhow!("hmac key: {e}")))?;
    mac.update(body);
    let provided = hex::decode(signature_hex)
        .map_err(|_| BridgeError::WebhookRejected { message: "malformed signature".into() })?;
    mac.verify_slice(&provided)
        .map_err(|_| BridgeError::WebhookRejected { message: "signature mismatch".into() })
}

/// Daraja STK callback shape
#[derive(Debug, Deserialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata")]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item")]
    pub item: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: Option<serde_json::Value>,
}

impl StkCallback {
    fn metadata_str(&self, name: &str) -> Option<String> {
        self.callback_metadata.as_ref()?.item.iter().find_map(|item| {
            if item.name != name {
                return None;
            }
            match item.value.as_ref()? {
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            }
        })
    }
}

/// Daraja B2C result shape
#[derive(Debug, Deserialize)]
pub struct B2cResultEnvelope {
    #[serde(rename = "Result")]
    pub result: B2cResult,
}

#[derive(Debug, Deserialize)]
pub struct B2cResult {
    #[serde(rename = "ConversationID")]
    pub conversation_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "TransactionID")]
    pub transaction_id: Option<String>,
    #[serde(rename = "ReferenceData")]
    pub reference_data: Option<B2cReferenceData>,
}

#[derive(Debug, Deserialize)]
pub struct B2cReferenceData {
    #[serde(rename = "ReferenceItem")]
    pub reference_item: Option<CallbackItem>,
}

/// POST /webhooks/mpesa/stk
pub async fn mpesa_stk_callback(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    check_mpesa_source(&state, &headers, Some(peer))?;

    let envelope: StkCallbackEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(_) => return Ok(ack_malformed("unparseable stkCallback")),
    };
    let callback = envelope.body.stk_callback;
    if callback.checkout_request_id.is_empty() {
        return Ok(ack_malformed("missing CheckoutRequestID"));
    }

    let token =
        DedupWindow::token("mpesa-stk", &callback.checkout_request_id, callback.result_code);
    if !state.dedup.check_and_insert(token, state.clock.now()) {
        tracing::info!(
            conversation_id = %callback.checkout_request_id,
            "duplicate STK callback dropped"
        );
        return Ok(ack_ok());
    }

    let receipt = callback.metadata_str("MpesaReceiptNumber").map(MpesaReceipt);
    let correlation = match callback.metadata_str("AccountReference") {
        Some(reference) => MpesaCorrelation::AccountReference(reference),
        None => MpesaCorrelation::ConversationId(callback.checkout_request_id.clone()),
    };

    let event = OrchestratorEvent::MpesaResult {
        correlation,
        result: MpesaResult {
            conversation_id: callback.checkout_request_id,
            result_code: callback.result_code,
            result_desc: callback.result_desc,
            receipt,
        },
    };
    if state.events.send(event).await.is_err() {
        return Err(BridgeError::Internal(anyhow::anyhow!("event queue closed")));
    }

    Ok(ack_ok())
}

/// POST /webhooks/mpesa/b2c
pub async fn mpesa_b2c_callback(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    check_mpesa_source(&state, &headers, Some(peer))?;

    let envelope: B2cResultEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(_) => return Ok(ack_malformed("unparseable Result")),
    };
    let result = envelope.result;
    if result.conversation_id.is_empty() {
        return Ok(ack_malformed("missing ConversationID"));
    }

    let token = DedupWindow::token("mpesa-b2c", &result.conversation_id, result.result_code);
    if !state.dedup.check_and_insert(token, state.clock.now()) {
        tracing::info!(conversation_id = %result.conversation_id, "duplicate B2C result dropped");
        return Ok(ack_ok());
    }

    // B2C results echo the account reference (leading hex of the payment
    // hash) through ReferenceData.
    let reference = result
        .reference_data
        .as_ref()
        .and_then(|d| d.reference_item.as_ref())
        .and_then(|item| item.value.as_ref())
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let correlation = match reference {
        Some(reference) => MpesaCorrelation::AccountReference(reference),
        None => MpesaCorrelation::ConversationId(result.conversation_id.clone()),
    };

    let event = OrchestratorEvent::MpesaResult {
        correlation,
        result: MpesaResult {
            conversation_id: result.conversation_id,
            result_code: result.result_code,
            result_desc: result.result_desc,
            receipt: result.transaction_id.map(MpesaReceipt),
        },
    };
    if state.events.send(event).await.is_err() {
        return Err(BridgeError::Internal(anyhow::anyhow!("event queue closed")));
    }

    Ok(ack_ok())
}

fn check_mpesa_source(
    state: &AppState,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Result<()> {
    let ip = source_ip(headers, peer);
    if !ip_allowed(&state.config.daraja.allowed_callback_cidrs, &ip) {
        tracing::warn!(ip = %ip, "M-Pesa callback from disallowed source");
        return Err(BridgeError::WebhookRejected { message: format!("source {ip} not allowed") });
    }
    Ok(())
}
