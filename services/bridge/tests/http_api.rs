/// HTTP surface tests: the axum router, webhook authentication and the
/// dedup window, exercised with tower oneshot requests.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, StatusCode};
use chrono::{TimeZone, Utc};
use futures::stream::BoxStream;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceExt;

use sambaza_bridge::api::build_router;
use sambaza_bridge::clock::{ManualClock, SharedClock};
use sambaza_bridge::lightning::{Invoice, LightningNode, Settlement};
use sambaza_bridge::mpesa::{DispatchOutcome, MpesaGateway, MpesaResult};
use sambaza_bridge::orchestrator::OrchestratorEvent;
use sambaza_bridge::rates::{RateFeed, RateProvider};
use sambaza_bridge::store::{MemoryTransactionStore, TransactionStore};
use sambaza_bridge::{build_state, AppState};
use sambaza_config::BridgeConfig;
use sambaza_errors::Result;
use sambaza_types::{LightningInvoice, PaymentHash, SatAmount, Transaction};

struct FixedFeed;

#[async_trait]
impl RateFeed for FixedFeed {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn fetch(&self) -> Result<Decimal> {
        Ok(Decimal::new(11_500_000, 0))
    }
}

#[derive(Default)]
struct StubLightning {
    counter: AtomicU64,
}

#[async_trait]
impl LightningNode for StubLightning {
    async fn create_invoice(
        &self,
        amount: SatAmount,
        _memo: &str,
        _expires_in: std::time::Duration,
    ) -> Result<Invoice> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&n.to_le_bytes());
        Ok(Invoice {
            payment_request: LightningInvoice(format!("lnbc{}n1stub{n}", amount.sats())),
            payment_hash: PaymentHash::from_bytes(bytes),
        })
    }

    async fn cancel_invoice(&self, _payment_hash: &PaymentHash) -> Result<()> {
        Ok(())
    }

    async fn subscribe_settlements(
        &self,
        _from_seq: u64,
    ) -> Result<BoxStream<'static, Settlement>> {
        Ok(Box::pin(futures::stream::pending()))
    }

    async fn refund(&self, _payment_hash: &PaymentHash, _amount: SatAmount) -> Result<()> {
        Ok(())
    }
}

struct StubMpesa;

#[async_trait]
impl MpesaGateway for StubMpesa {
    async fn dispatch(&self, tx: &Transaction) -> Result<DispatchOutcome> {
        Ok(DispatchOutcome {
            conversation_id: format!("ws_CO_{}", tx.payment_hash.account_reference()),
            accepted: true,
            description: "Accepted".to_string(),
        })
    }

    async fn query_status(&self, _tx: &Transaction) -> Result<Option<MpesaResult>> {
        Ok(None)
    }
}

async fn test_state() -> (AppState, mpsc::Receiver<OrchestratorEvent>) {
    let clock: SharedClock =
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()));

    let feeds: Vec<Arc<dyn RateFeed>> =
        vec![Arc::new(FixedFeed), Arc::new(FixedFeed), Arc::new(FixedFeed)];
    let rates = Arc::new(RateProvider::new(
        feeds,
        Decimal::ZERO,
        std::time::Duration::from_secs(5),
        clock.clone(),
    ));
    rates.refresh().await;

    build_state(
        BridgeConfig::from_env().unwrap(),
        Arc::new(MemoryTransactionStore::new()) as Arc<dyn TransactionStore>,
        Arc::new(StubLightning::default()) as Arc<dyn LightningNode>,
        Arc::new(StubMpesa) as Arc<dyn MpesaGateway>,
        rates,
        clock,
    )
}

fn with_peer(mut request: Request<Body>) -> Request<Body> {
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 52000))));
    request
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn create_and_read_status_over_http() {
    let (state, _rx) = test_state().await;
    let app = build_router(state);

    let create = Request::builder()
        .method(Method::POST)
        .uri("/v1/send-money")
        .header("content-type", "application/json")
        .header("user-agent", "Mozilla/5.0")
        .body(Body::from(
            serde_json::json!({
                "recipient_phone": "254712345678",
                "kes_amount": 1000,
                "idempotency_key": "k1"
            })
            .to_string(),
        ))
        .unwrap();

    let response = app.clone().oneshot(with_peer(create)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;

    assert_eq!(created["kes_amount"], 1000);
    assert_eq!(created["fee_kes"], 25);
    assert_eq!(created["btc_amount_sats"], 8923);
    let payment_hash = created["payment_hash"].as_str().unwrap().to_string();
    assert_eq!(payment_hash.len(), 64);
    assert!(created["lightning_invoice"].as_str().unwrap().starts_with("lnbc"));

    let status = Request::builder()
        .method(Method::GET)
        .uri(format!("/v1/transactions/{payment_hash}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(with_peer(status)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["state"], "LIGHTNING_PENDING");
    assert_eq!(status["kes_amount"], 1000);

    // An unknown hash is simply not found; the hash is the capability
    let missing = Request::builder()
        .method(Method::GET)
        .uri(format!("/v1/transactions/{}", "0".repeat(64)))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(with_peer(missing)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_create_is_rejected() {
    let (state, _rx) = test_state().await;
    let app = build_router(state);

    // Merchant code on SEND_MONEY is a 400
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/send-money")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "recipient_phone": "254712345678",
                "kes_amount": 1000,
                "merchant_code": "123456"
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(with_peer(request)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Amount over the flow cap
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/buy-airtime")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "recipient_phone": "254712345678",
                "kes_amount": 20_000
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.oneshot(with_peer(request)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[tokio::test]
async fn lightning_webhook_authenticates_and_dedups() {
    let (state, mut events_rx) = test_state().await;
    let secret = state.config.webhooks.lightning_secret.clone();
    let app = build_router(state);

    let body = serde_json::json!({
        "payment_hash": "ab".repeat(32),
        "settled_at": "2025-06-01T12:01:00Z",
        "amount_sats": 8923
    })
    .to_string();

    // Unsigned delivery is rejected
    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/lightning")
        .header("content-type", "application/json")
        .body(Body::from(body.clone()))
        .unwrap();
    let response = app.clone().oneshot(with_peer(request)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Signed delivery is accepted and enqueued
    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/lightning")
        .header("content-type", "application/json")
        .header("x-signature", sign(&secret, body.as_bytes()))
        .body(Body::from(body.clone()))
        .unwrap();
    let response = app.clone().oneshot(with_peer(request)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(matches!(
        events_rx.try_recv(),
        Ok(OrchestratorEvent::InvoiceSettled { .. })
    ));

    // The same delivery again: 200, but nothing new enqueued
    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/lightning")
        .header("content-type", "application/json")
        .header("x-signature", sign(&secret, body.as_bytes()))
        .body(Body::from(body))
        .unwrap();
    let response = app.oneshot(with_peer(request)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(events_rx.try_recv().is_err());
}

#[tokio::test]
async fn mpesa_webhook_enforces_source_allowlist() {
    let (state, mut events_rx) = test_state().await;
    let app = build_router(state);

    let body = serde_json::json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_1",
                "ResultCode": 0,
                "ResultDesc": "ok",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                        { "Name": "AccountReference", "Value": "abcdefabcdef" }
                    ]
                }
            }
        }
    })
    .to_string();

    // From outside the allowlist: rejected, nothing enqueued
    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/mpesa/stk")
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.50")
        .body(Body::from(body.clone()))
        .unwrap();
    let response = app.clone().oneshot(with_peer(request)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(events_rx.try_recv().is_err());

    // From Daraja's range: accepted
    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/mpesa/stk")
        .header("content-type", "application/json")
        .header("x-forwarded-for", "196.201.214.10")
        .body(Body::from(body))
        .unwrap();
    let response = app.oneshot(with_peer(request)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(matches!(
        events_rx.try_recv(),
        Ok(OrchestratorEvent::MpesaResult { .. })
    ));
}

#[tokio::test]
async fn malformed_mpesa_callback_gets_result_code_one() {
    let (state, _rx) = test_state().await;
    let app = build_router(state);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/mpesa/b2c")
        .header("content-type", "application/json")
        .header("x-forwarded-for", "196.201.214.10")
        .body(Body::from("{\"not\": \"a result\"}"))
        .unwrap();
    let response = app.oneshot(with_peer(request)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let ack = body_json(response).await;
    assert_eq!(ack["ResultCode"], 1);
}
