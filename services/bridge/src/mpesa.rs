/// Daraja (M-Pesa) adapter
///
/// Executes the flow-specific Daraja operation: B2C disbursement for
/// SEND_MONEY and BUY_AIRTIME, STK-Push for the till/paybill flows. The
/// adapter is the innermost guard of the three-layer double-payout
/// defence: the orchestrator checks state, this adapter refuses a second
/// dispatch for the same transaction, and Daraja itself dedups on the
/// account reference (the leading 12 hex of the payment hash).

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sambaza_config::DarajaConfig;
use sambaza_errors::{BridgeError, Result};
use sambaza_types::{MpesaReceipt, Transaction, TransactionId};
use serde::Deserialize;
use std::collections::HashMap;

use crate::clock::SharedClock;

/// Synchronous outcome of a dispatch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub conversation_id: String,
    pub accepted: bool,
    pub description: String,
}

/// A terminal result for a dispatched payout, from the asynchronous
/// callback or from a reconciler status query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpesaResult {
    pub conversation_id: String,
    pub result_code: i64,
    pub result_desc: String,
    /// Present when result_code == 0
    pub receipt: Option<MpesaReceipt>,
}

impl MpesaResult {
    pub fn succeeded(&self) -> bool {
        self.result_code == 0
    }
}

#[async_trait]
pub trait MpesaGateway: Send + Sync {
    /// Dispatch the payout for `tx`. At most one wire dispatch happens per
    /// transaction id; a repeat call returns the recorded outcome.
    async fn dispatch(&self, tx: &Transaction) -> Result<DispatchOutcome>;

    /// Re-query Daraja for a payout whose callback never arrived.
    /// `None` means still in flight.
    async fn query_status(&self, tx: &Transaction) -> Result<Option<MpesaResult>>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct OAuthResponse {
    access_token: String,
    /// Seconds, as a string per Daraja's contract
    expires_in: String,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    response_description: String,
}

#[derive(Debug, Deserialize)]
struct B2cResponse {
    #[serde(rename = "ConversationID")]
    conversation_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    response_description: String,
}

#[derive(Debug, Deserialize)]
struct TransactionStatusResponse {
    #[serde(rename = "ResultCode")]
    result_code: Option<i64>,
    #[serde(rename = "ResultDesc", default)]
    result_desc: String,
    #[serde(rename = "ReceiptNo")]
    receipt_no: Option<String>,
}

pub struct DarajaClient {
    http: reqwest::Client,
    config: DarajaConfig,
    clock: SharedClock,
    /// Single-flight OAuth refresh: concurrent dispatches wait on one lock
    /// and share the refreshed token.
    token: tokio::sync::Mutex<Option<CachedToken>>,
    /// tx_id -> recorded outcome. Presence alone means a dispatch reached
    /// the wire; a repeat call never dispatches again.
    dispatched: Mutex<HashMap<TransactionId, Option<DispatchOutcome>>>,
}

impl DarajaClient {
    pub fn new(config: DarajaConfig, clock: SharedClock) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            config,
            clock,
            token: tokio::sync::Mutex::new(None),
            dispatched: Mutex::new(HashMap::new()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// Cached OAuth bearer token, refreshed 60 s before expiry.
    async fn access_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        let now = self.clock.now();

        if let Some(cached) = guard.as_ref() {
            if cached.expires_at - Duration::seconds(60) > now {
                return Ok(cached.access_token.clone());
            }
        }

        let basic = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.config.consumer_key, self.config.consumer_secret
        ));

        let response = self
            .http
            .get(self.url("/oauth/v1/generate?grant_type=client_credentials"))
            .header("Authorization", format!("Basic {basic}"))
            .send()
            .await
            .map_err(|e| BridgeError::daraja_transient(format!("oauth: {e}")))?;

        if !response.status().is_success() {
            return Err(BridgeError::daraja_transient(format!(
                "oauth: HTTP {}",
                response.status()
            )));
        }

        let body: OAuthResponse =
            response.json().await.map_err(|e| BridgeError::daraja_transient(format!("oauth: {e}")))?;
        let expires_in: i64 = body.expires_in.parse().unwrap_or(3600);

        let token = CachedToken {
            access_token: body.access_token,
            expires_at: now + Duration::seconds(expires_in),
        };
        let access_token = token.access_token.clone();
        *guard = Some(token);

        Ok(access_token)
    }

    fn stk_password(&self, timestamp: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(format!(
            "{}{}{timestamp}",
            self.config.shortcode, self.config.passkey
        ))
    }

    async fn dispatch_stk(&self, tx: &Transaction, token: &str) -> Result<DispatchOutcome> {
        let timestamp = self.clock.now().format("%Y%m%d%H%M%S").to_string();
        let transaction_type = if tx.flow.requires_merchant_code() && !tx.flow.requires_account_number()
        {
            "CustomerBuyGoodsOnline"
        } else {
            "CustomerPayBillOnline"
        };
        let merchant = tx.merchant_code.clone().unwrap_or_else(|| self.config.shortcode.clone());

        let response = self
            .http
            .post(self.url("/mpesa/stkpush/v1/processrequest"))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "BusinessShortCode": self.config.shortcode,
                "Password": self.stk_password(&timestamp),
                "Timestamp": timestamp,
                "TransactionType": transaction_type,
                "Amount": tx.kes_amount.kes(),
                "PartyA": tx.recipient_phone.as_str(),
                "PartyB": merchant,
                "PhoneNumber": tx.recipient_phone.as_str(),
                "CallBackURL": format!("{}/stk", self.config.callback_base_url),
                "AccountReference": tx.payment_hash.account_reference(),
                "TransactionDesc": tx.flow.as_str(),
            }))
            .send()
            .await
            .map_err(|e| BridgeError::daraja_transient(format!("stk push: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(BridgeError::daraja_transient(format!("stk push: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(BridgeError::daraja_permanent(format!("stk push: HTTP {status}")));
        }

        let body: StkPushResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::daraja_transient(format!("stk push: {e}")))?;

        Ok(DispatchOutcome {
            conversation_id: body.checkout_request_id,
            accepted: body.response_code == "0",
            description: body.response_description,
        })
    }

    async fn dispatch_b2c(&self, tx: &Transaction, token: &str) -> Result<DispatchOutcome> {
        let response = self
            .http
            .post(self.url("/mpesa/b2c/v1/paymentrequest"))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "InitiatorName": "sambaza",
                "CommandID": "BusinessPayment",
                "Amount": tx.kes_amount.kes(),
                "PartyA": self.config.shortcode,
                "PartyB": tx.recipient_phone.as_str(),
                "Remarks": tx.flow.as_str(),
                "QueueTimeOutURL": format!("{}/b2c", self.config.callback_base_url),
                "ResultURL": format!("{}/b2c", self.config.callback_base_url),
                "Occasion": tx.payment_hash.account_reference(),
            }))
            .send()
            .await
            .map_err(|e| BridgeError::daraja_transient(format!("b2c: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(BridgeError::daraja_transient(format!("b2c: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(BridgeError::daraja_permanent(format!("b2c: HTTP {status}")));
        }

        let body: B2cResponse =
            response.json().await.map_err(|e| BridgeError::daraja_transient(format!("b2c: {e}")))?;

        Ok(DispatchOutcome {
            conversation_id: body.conversation_id,
            accepted: body.response_code == "0",
            description: body.response_description,
        })
    }
}

#[async_trait]
impl MpesaGateway for DarajaClient {
    async fn dispatch(&self, tx: &Transaction) -> Result<DispatchOutcome> {
        // Innermost double-dispatch guard. Claim the slot before touching
        // the wire; a concurrent or repeated call for the same tx sees the
        // claim and never dispatches.
        {
            let mut dispatched = self.dispatched.lock();
            match dispatched.get(&tx.id) {
                Some(Some(outcome)) => return Ok(outcome.clone()),
                Some(None) => {
                    return Err(BridgeError::daraja_transient(
                        "dispatch already in flight for this transaction",
                    ))
                }
                None => {
                    dispatched.insert(tx.id, None);
                }
            }
        }

        let token = match self.access_token().await {
            Ok(token) => token,
            Err(err) => {
                // Nothing reached the wire; free the slot for a retry.
                self.dispatched.lock().remove(&tx.id);
                return Err(err);
            }
        };

        let result = if tx.flow.uses_stk_push() {
            self.dispatch_stk(tx, &token).await
        } else {
            self.dispatch_b2c(tx, &token).await
        };

        match result {
            Ok(outcome) => {
                self.dispatched.lock().insert(tx.id, Some(outcome.clone()));
                Ok(outcome)
            }
            Err(err) => {
                // The request may or may not have reached Daraja. Permanent
                // rejections are definitive; transport errors free the slot
                // and lean on Daraja's reference dedup for the ambiguous
                // case.
                self.dispatched.lock().remove(&tx.id);
                Err(err)
            }
        }
    }

    async fn query_status(&self, tx: &Transaction) -> Result<Option<MpesaResult>> {
        let token = self.access_token().await?;
        let conversation_id = tx
            .provider_conversation_id
            .clone()
            .ok_or_else(|| BridgeError::daraja_permanent("no conversation id to query"))?;

        let response = self
            .http
            .post(self.url("/mpesa/transactionstatus/v1/query"))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "Initiator": "sambaza",
                "CommandID": "TransactionStatusQuery",
                "TransactionID": conversation_id,
                "PartyA": self.config.shortcode,
                "IdentifierType": "4",
                "Remarks": "reconciliation",
                "Occasion": tx.payment_hash.account_reference(),
            }))
            .send()
            .await
            .map_err(|e| BridgeError::daraja_transient(format!("status query: {e}")))?;

        if !response.status().is_success() {
            return Err(BridgeError::daraja_transient(format!(
                "status query: HTTP {}",
                response.status()
            )));
        }

        let body: TransactionStatusResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::daraja_transient(format!("status query: {e}")))?;

        Ok(body.result_code.map(|code| MpesaResult {
            conversation_id,
            result_code: code,
            result_desc: body.result_desc,
            receipt: body.receipt_no.map(MpesaReceipt),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpesa_result_success_is_code_zero() {
        let ok = MpesaResult {
            conversation_id: "ws_CO_1".to_string(),
            result_code: 0,
            result_desc: "ok".to_string(),
            receipt: Some(MpesaReceipt("MPE123".to_string())),
        };
        assert!(ok.succeeded());

        let failed = MpesaResult { result_code: 1032, receipt: None, ..ok };
        assert!(!failed.succeeded());
    }
}
