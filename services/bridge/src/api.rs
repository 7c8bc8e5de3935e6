/// Client-facing API
///
/// One create endpoint per product flow, status and ledger reads keyed by
/// payment hash (the hash is the capability; there are no accounts), the
/// receipt surface, and health.

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::HeaderMap,
    response::{Html, Json},
    routing::{get, post},
    Router,
};
use sambaza_errors::{BridgeError, Result};
use sambaza_types::{ClientOrigin, Flow, PaymentHash};
use serde::Deserialize;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;

use crate::domain::{
    CreatePaymentRequest, CreatePaymentResponse, EventResponse, TransactionStatusResponse,
};
use crate::receipt::ReceiptGenerator;
use crate::webhook;
use crate::AppState;

/// Build the full router. Webhook routes are mounted here as well so one
/// listener serves both surfaces.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Flow-create endpoints
        .route("/v1/send-money", post(create_send_money))
        .route("/v1/buy-airtime", post(create_buy_airtime))
        .route("/v1/paybill", post(create_paybill))
        .route("/v1/buy-goods", post(create_buy_goods))
        .route("/v1/scan-pay", post(create_scan_pay))
        // Transaction reads, keyed by payment hash
        .route("/v1/transactions/:payment_hash", get(transaction_status))
        .route("/v1/transactions/:payment_hash/events", get(transaction_events))
        .route("/v1/transactions/:payment_hash/cancel", post(cancel_transaction))
        // Receipts
        .route("/v1/receipts/:payment_hash", get(receipt_html))
        .route("/v1/receipts/:payment_hash/verify", get(receipt_verify))
        // Webhooks
        .route("/webhooks/lightning", post(webhook::lightning_settlement))
        .route("/webhooks/mpesa/stk", post(webhook::mpesa_stk_callback))
        .route("/webhooks/mpesa/b2c", post(webhook::mpesa_b2c_callback))
        .layer(CorsLayer::permissive())
        .layer(sambaza_tracing::trace_id_layer())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let database = match &state.db {
        Some(pool) => match sambaza_database::health_check(pool).await {
            Ok(health) => serde_json::to_value(health).unwrap_or(serde_json::Value::Null),
            Err(_) => serde_json::json!({ "status": "unreachable" }),
        },
        None => serde_json::json!({ "status": "in-memory" }),
    };

    Json(serde_json::json!({
        "status": "healthy",
        "service": "sambaza-bridge",
        "database": database,
        "rates": state.orchestrator.rates().health(),
        "timestamp": state.clock.now(),
    }))
}

fn client_origin(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientOrigin {
    let source_ip = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|chain| chain.split(',').next())
        .map(|ip| ip.trim().to_string())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default();
    let user_agent = headers
        .get("user-agent")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    ClientOrigin { source_ip, user_agent }
}

async fn create_payment(
    state: AppState,
    flow: Flow,
    headers: HeaderMap,
    peer: Option<SocketAddr>,
    request: CreatePaymentRequest,
) -> Result<Json<CreatePaymentResponse>> {
    let origin = client_origin(&headers, peer);
    let params = request.into_new_payment(flow, origin)?;
    let tx = state.orchestrator.create_payment(params).await?;
    Ok(Json(CreatePaymentResponse::from(&tx)))
}

async fn create_send_money(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<Json<CreatePaymentResponse>> {
    create_payment(state, Flow::SendMoney, headers, Some(peer), request).await
}

async fn create_buy_airtime(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<Json<CreatePaymentResponse>> {
    create_payment(state, Flow::BuyAirtime, headers, Some(peer), request).await
}

async fn create_paybill(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<Json<CreatePaymentResponse>> {
    create_payment(state, Flow::Paybill, headers, Some(peer), request).await
}

async fn create_buy_goods(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<Json<CreatePaymentResponse>> {
    create_payment(state, Flow::BuyGoods, headers, Some(peer), request).await
}

async fn create_scan_pay(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<Json<CreatePaymentResponse>> {
    create_payment(state, Flow::ScanPay, headers, Some(peer), request).await
}

fn parse_hash(raw: &str) -> Result<PaymentHash> {
    PaymentHash::parse(raw).map_err(|_| BridgeError::NotFound)
}

async fn transaction_status(
    State(state): State<AppState>,
    Path(payment_hash): Path<String>,
) -> Result<Json<TransactionStatusResponse>> {
    let hash = parse_hash(&payment_hash)?;
    let tx = state.orchestrator.store().get_by_payment_hash(&hash).await?;
    Ok(Json(TransactionStatusResponse::from(&tx)))
}

async fn transaction_events(
    State(state): State<AppState>,
    Path(payment_hash): Path<String>,
) -> Result<Json<Vec<EventResponse>>> {
    let hash = parse_hash(&payment_hash)?;
    let tx = state.orchestrator.store().get_by_payment_hash(&hash).await?;
    let events = state.orchestrator.store().events(tx.id).await?;
    Ok(Json(events.iter().map(EventResponse::from).collect()))
}

async fn cancel_transaction(
    State(state): State<AppState>,
    Path(payment_hash): Path<String>,
) -> Result<Json<TransactionStatusResponse>> {
    let hash = parse_hash(&payment_hash)?;
    let tx = state.orchestrator.cancel(&hash).await?;
    Ok(Json(TransactionStatusResponse::from(&tx)))
}

async fn receipt_html(
    State(state): State<AppState>,
    Path(payment_hash): Path<String>,
) -> Result<Html<String>> {
    let hash = parse_hash(&payment_hash)?;
    let tx = state.orchestrator.store().get_by_payment_hash(&hash).await?;
    let receipt =
        state.orchestrator.store().get_receipt(tx.id).await?.ok_or(BridgeError::NotFound)?;
    Ok(Html(ReceiptGenerator::render_html(&receipt)))
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    qr: String,
}

async fn receipt_verify(
    State(state): State<AppState>,
    Path(payment_hash): Path<String>,
    Query(query): Query<VerifyQuery>,
) -> Result<Json<serde_json::Value>> {
    let hash = parse_hash(&payment_hash)?;
    let claims = state.orchestrator.receipts().verify(&query.qr)?;
    let matches = claims.payment_hash == hash.as_str();
    Ok(Json(serde_json::json!({
        "valid": matches,
        "claims": claims,
    })))
}
