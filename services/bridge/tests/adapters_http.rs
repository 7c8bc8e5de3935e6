/// HTTP adapter tests against stubbed upstreams: the Daraja client's
/// OAuth single-flight and dispatch guard, the LND REST client, and the
/// rate feed parser.

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sambaza_bridge::clock::{ManualClock, SharedClock};
use sambaza_bridge::lightning::{LightningNode, LndRestClient};
use sambaza_bridge::mpesa::{DarajaClient, MpesaGateway};
use sambaza_bridge::rates::{HttpRateFeed, RateFeed};
use sambaza_config::{DarajaConfig, LightningConfig};
use sambaza_types::{
    ClientOrigin, Flow, KesAmount, Msisdn, PaymentHash, SatAmount, Transaction, TransactionId,
    TxState,
};

fn clock() -> SharedClock {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()))
}

fn daraja_config(base_url: String) -> DarajaConfig {
    DarajaConfig {
        consumer_key: "ck".to_string(),
        consumer_secret: "cs".to_string(),
        shortcode: "174379".to_string(),
        passkey: "pk".to_string(),
        base_url,
        callback_base_url: "https://bridge.example/webhooks/mpesa".to_string(),
        http_timeout_secs: 5,
        allowed_callback_cidrs: vec!["196.201.214.0/24".to_string()],
    }
}

fn converting_tx(flow: Flow) -> Transaction {
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    Transaction {
        id: TransactionId::new(),
        flow,
        payment_hash: PaymentHash::parse(&"ef".repeat(32)).unwrap(),
        recipient_phone: Msisdn::parse("254712345678").unwrap(),
        merchant_code: flow.requires_merchant_code().then(|| "123456".to_string()),
        account_number: flow.requires_account_number().then(|| "INV-1".to_string()),
        kes_amount: KesAmount::from_kes(1000),
        btc_amount: SatAmount::new(8923),
        rate: Decimal::new(11_500_000, 0),
        fee_kes: KesAmount::from_kes(25),
        state: TxState::Converting,
        created_at: now,
        updated_at: now,
        quote_expires_at: now + chrono::Duration::minutes(15),
        lightning_invoice: None,
        settled_at: Some(now),
        mpesa_receipt: None,
        provider_conversation_id: None,
        failure: None,
        risk_score: Some(0.05),
        idempotency_key: None,
        origin: ClientOrigin::default(),
        version: 3,
    }
}

async fn mount_oauth(server: &MockServer, expect: u64) {
    Mock::given(method("GET"))
        .and(path("/oauth/v1/generate"))
        .and(query_param("grant_type", "client_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "token-1",
            "expires_in": "3599"
        })))
        .expect(expect)
        .mount(server)
        .await;
}

#[tokio::test]
async fn daraja_stk_dispatch_shares_one_token_and_one_wire_call() {
    let server = MockServer::start().await;
    mount_oauth(&server, 1).await;

    Mock::given(method("POST"))
        .and(path("/mpesa/stkpush/v1/processrequest"))
        .and(body_partial_json(serde_json::json!({
            "TransactionType": "CustomerPayBillOnline",
            "AccountReference": "efefefefefef",
            "PartyB": "123456"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": "ws_CO_191",
            "ResponseCode": "0",
            "ResponseDescription": "Success. Request accepted for processing"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = DarajaClient::new(daraja_config(server.uri()), clock());
    let tx = converting_tx(Flow::Paybill);

    let first = client.dispatch(&tx).await.unwrap();
    assert!(first.accepted);
    assert_eq!(first.conversation_id, "ws_CO_191");

    // The dispatched-set returns the recorded outcome, no second wire call
    let second = client.dispatch(&tx).await.unwrap();
    assert_eq!(second, first);
}

#[tokio::test]
async fn daraja_b2c_uses_the_b2c_endpoint() {
    let server = MockServer::start().await;
    mount_oauth(&server, 1).await;

    Mock::given(method("POST"))
        .and(path("/mpesa/b2c/v1/paymentrequest"))
        .and(body_partial_json(serde_json::json!({
            "CommandID": "BusinessPayment",
            "PartyB": "254712345678",
            "Occasion": "efefefefefef"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ConversationID": "AG_20250601_0001",
            "OriginatorConversationID": "10571-7910404-1",
            "ResponseCode": "0",
            "ResponseDescription": "Accept the service request successfully."
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = DarajaClient::new(daraja_config(server.uri()), clock());
    let outcome = client.dispatch(&converting_tx(Flow::SendMoney)).await.unwrap();
    assert!(outcome.accepted);
    assert_eq!(outcome.conversation_id, "AG_20250601_0001");
}

#[tokio::test]
async fn daraja_server_error_frees_the_dispatch_slot() {
    let server = MockServer::start().await;
    mount_oauth(&server, 1).await;

    Mock::given(method("POST"))
        .and(path("/mpesa/b2c/v1/paymentrequest"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = DarajaClient::new(daraja_config(server.uri()), clock());
    let tx = converting_tx(Flow::SendMoney);

    assert!(client.dispatch(&tx).await.is_err());
    // The slot is free again; a retry reaches the wire instead of being
    // served a phantom outcome
    assert!(client.dispatch(&tx).await.is_err());
}

#[tokio::test]
async fn lnd_client_creates_invoices() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/invoices"))
        .and(body_partial_json(serde_json::json!({ "value": "8923" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "payment_request": "lnbc89230n1realinvoice",
            "r_hash": "ab".repeat(32),
            "add_index": "7"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = LndRestClient::new(&LightningConfig {
        rpc_endpoint: server.uri(),
        credentials: "0201036c6e64".to_string(),
        rpc_timeout_secs: 5,
    });

    let invoice = client
        .create_invoice(
            SatAmount::new(8923),
            "Sambaza SEND_MONEY",
            std::time::Duration::from_secs(900),
        )
        .await
        .unwrap();

    assert_eq!(invoice.payment_request.0, "lnbc89230n1realinvoice");
    assert_eq!(invoice.payment_hash.as_str(), "ab".repeat(32));
}

#[tokio::test]
async fn rate_feed_parses_and_rejects() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/btc-kes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "rate": 11500000.0
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let good = HttpRateFeed::new(
        "good",
        format!("{}/btc-kes", server.uri()),
        std::time::Duration::from_secs(5),
    );
    assert_eq!(good.fetch().await.unwrap(), Decimal::new(11_500_000, 0));

    let broken = HttpRateFeed::new(
        "broken",
        format!("{}/broken", server.uri()),
        std::time::Duration::from_secs(5),
    );
    assert!(broken.fetch().await.is_err());
}
