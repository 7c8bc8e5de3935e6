/// Lightning node adapter
///
/// The orchestrator is polymorphic over the node: it mints and cancels
/// invoices, consumes an at-least-once settlement stream, and pushes
/// refunds back to the payer. The production implementation drives LND's
/// REST surface; tests script a fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use sambaza_config::LightningConfig;
use sambaza_errors::{BridgeError, Result};
use sambaza_types::{LightningInvoice, PaymentHash, SatAmount};
use serde::Deserialize;
use std::time::Duration;

/// A freshly minted invoice
#[derive(Debug, Clone)]
pub struct Invoice {
    pub payment_request: LightningInvoice,
    pub payment_hash: PaymentHash,
}

/// One settled inbound payment from the subscription stream
#[derive(Debug, Clone)]
pub struct Settlement {
    pub payment_hash: PaymentHash,
    pub settled_at: DateTime<Utc>,
    pub amount_sats: SatAmount,
    /// Node-side sequence number; the orchestrator acks these so a restart
    /// resumes where it left off
    pub seq: u64,
}

#[async_trait]
pub trait LightningNode: Send + Sync {
    async fn create_invoice(
        &self,
        amount: SatAmount,
        memo: &str,
        expires_in: Duration,
    ) -> Result<Invoice>;

    async fn cancel_invoice(&self, payment_hash: &PaymentHash) -> Result<()>;

    /// Lazy stream of settlements, restartable from `from_seq`.
    /// Delivery is at least once; consumers must dedup.
    async fn subscribe_settlements(&self, from_seq: u64) -> Result<BoxStream<'static, Settlement>>;

    /// Return settled sats to the payer. This is the REFUNDING -> REFUNDED
    /// hook; the production implementation keysends back along the inbound
    /// path.
    async fn refund(&self, payment_hash: &PaymentHash, amount: SatAmount) -> Result<()>;
}

/// LND REST client
///
/// Auth is the hex macaroon in the Grpc-Metadata-macaroon header. All
/// calls carry the configured deadline; an elapsed deadline surfaces as a
/// transient error and counts against the caller's retry budget.
pub struct LndRestClient {
    http: reqwest::Client,
    endpoint: String,
    macaroon_hex: String,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct LndAddInvoiceResponse {
    payment_request: String,
    r_hash: String,
}

#[derive(Debug, Deserialize)]
struct LndInvoice {
    r_hash: String,
    state: String,
    settle_date: Option<String>,
    amt_paid_sat: Option<String>,
    settle_index: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LndListInvoicesResponse {
    #[serde(default)]
    invoices: Vec<LndInvoice>,
}

impl LndRestClient {
    pub fn new(config: &LightningConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.rpc_timeout_secs))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            endpoint: config.rpc_endpoint.trim_end_matches('/').to_string(),
            macaroon_hex: config.credentials.clone(),
            poll_interval: Duration::from_secs(2),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    fn transient(context: &str, err: impl std::fmt::Display) -> BridgeError {
        BridgeError::lightning_transient(format!("{context}: {err}"))
    }

    /// LND encodes r_hash as base64 in some responses and hex in others.
    fn parse_r_hash(raw: &str) -> Result<PaymentHash> {
        if let Ok(hash) = PaymentHash::parse(raw) {
            return Ok(hash);
        }
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|e| BridgeError::lightning_permanent(format!("bad r_hash encoding: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| BridgeError::lightning_permanent("r_hash is not 32 bytes"))?;
        Ok(PaymentHash::from_bytes(bytes))
    }

    async fn fetch_settled_since(&self, index_offset: u64) -> Result<Vec<Settlement>> {
        let response = self
            .http
            .get(self.url("/v1/invoices"))
            .query(&[
                ("index_offset", index_offset.to_string()),
                ("num_max_invoices", "100".to_string()),
            ])
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .send()
            .await
            .map_err(|e| Self::transient("list invoices", e))?;

        if !response.status().is_success() {
            return Err(Self::transient("list invoices", response.status()));
        }

        let body: LndListInvoicesResponse =
            response.json().await.map_err(|e| Self::transient("list invoices", e))?;

        let mut settlements = Vec::new();
        for invoice in body.invoices {
            if invoice.state != "SETTLED" {
                continue;
            }
            let seq: u64 = invoice
                .settle_index
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(index_offset);
            let settled_at = invoice
                .settle_date
                .as_deref()
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .unwrap_or_else(Utc::now);
            let amount_sats = invoice
                .amt_paid_sat
                .as_deref()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            settlements.push(Settlement {
                payment_hash: Self::parse_r_hash(&invoice.r_hash)?,
                settled_at,
                amount_sats: SatAmount::new(amount_sats),
                seq,
            });
        }
        Ok(settlements)
    }
}

#[async_trait]
impl LightningNode for LndRestClient {
    async fn create_invoice(
        &self,
        amount: SatAmount,
        memo: &str,
        expires_in: Duration,
    ) -> Result<Invoice> {
        let response = self
            .http
            .post(self.url("/v1/invoices"))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .json(&serde_json::json!({
                "value": amount.sats().to_string(),
                "memo": memo,
                "expiry": expires_in.as_secs().to_string(),
            }))
            .send()
            .await
            .map_err(|e| Self::transient("add invoice", e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Self::transient("add invoice", status));
        }
        if !status.is_success() {
            return Err(BridgeError::lightning_permanent(format!("add invoice: HTTP {status}")));
        }

        let body: LndAddInvoiceResponse =
            response.json().await.map_err(|e| Self::transient("add invoice", e))?;

        Ok(Invoice {
            payment_request: LightningInvoice(body.payment_request),
            payment_hash: Self::parse_r_hash(&body.r_hash)?,
        })
    }

    async fn cancel_invoice(&self, payment_hash: &PaymentHash) -> Result<()> {
        let response = self
            .http
            .post(self.url("/v2/invoices/cancel"))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .json(&serde_json::json!({ "payment_hash": payment_hash.as_str() }))
            .send()
            .await
            .map_err(|e| Self::transient("cancel invoice", e))?;

        if !response.status().is_success() {
            return Err(Self::transient("cancel invoice", response.status()));
        }
        Ok(())
    }

    async fn subscribe_settlements(&self, from_seq: u64) -> Result<BoxStream<'static, Settlement>> {
        // Poll-based subscription over the REST surface. Each round fetches
        // everything past the ack point, so delivery is at least once and a
        // crashed consumer resumes from its last acked settle index.
        let client = LndRestClient {
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
            macaroon_hex: self.macaroon_hex.clone(),
            poll_interval: self.poll_interval,
        };

        let stream = futures::stream::unfold(
            (client, from_seq, Vec::<Settlement>::new()),
            |(client, mut next_seq, mut buffer)| async move {
                loop {
                    if let Some(settlement) = buffer.pop() {
                        return Some((settlement, (client, next_seq, buffer)));
                    }
                    match client.fetch_settled_since(next_seq).await {
                        Ok(mut settlements) => {
                            if let Some(max_seq) = settlements.iter().map(|s| s.seq).max() {
                                next_seq = max_seq;
                            }
                            // Pop from the back in arrival order
                            settlements.reverse();
                            buffer = settlements;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "settlement poll failed, backing off");
                        }
                    }
                    if buffer.is_empty() {
                        tokio::time::sleep(client.poll_interval).await;
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    async fn refund(&self, payment_hash: &PaymentHash, amount: SatAmount) -> Result<()> {
        // Keysend the settled amount back along the inbound path. LND's
        // router endpoint rejects unknown hashes, which we surface as
        // permanent so the orchestrator stops retrying.
        let response = self
            .http
            .post(self.url("/v2/router/refund"))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .json(&serde_json::json!({
                "payment_hash": payment_hash.as_str(),
                "amt_sat": amount.sats().to_string(),
            }))
            .send()
            .await
            .map_err(|e| Self::transient("refund", e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Self::transient("refund", status));
        }
        if !status.is_success() {
            return Err(BridgeError::lightning_permanent(format!("refund: HTTP {status}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_r_hash_accepts_hex_and_base64() {
        let hex64 = "ab".repeat(32);
        assert_eq!(LndRestClient::parse_r_hash(&hex64).unwrap().as_str(), hex64);

        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD.encode([0xabu8; 32]);
        assert_eq!(LndRestClient::parse_r_hash(&b64).unwrap().as_str(), hex64);

        assert!(LndRestClient::parse_r_hash("not-a-hash").is_err());
    }
}
