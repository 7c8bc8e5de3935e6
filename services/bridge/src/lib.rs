/// Sambaza bridge service
///
/// Converts inbound Bitcoin Lightning payments into outbound M-Pesa
/// disbursements across five product flows. The orchestrator drives each
/// transaction through quote -> invoice -> settle -> convert -> payout ->
/// receipt; everything around it (store, adapters, risk, webhooks) hangs
/// off the interfaces wired up here.

use std::sync::Arc;
use tokio::sync::mpsc;

pub mod api;
pub mod clock;
pub mod domain;
pub mod idempotency;
pub mod lightning;
pub mod mpesa;
pub mod orchestrator;
pub mod quote;
pub mod rates;
pub mod receipt;
pub mod retry;
pub mod risk;
pub mod store;
pub mod sweeper;
pub mod webhook;

use clock::SharedClock;
use idempotency::IdempotencyIndex;
use lightning::LightningNode;
use mpesa::MpesaGateway;
use orchestrator::{Orchestrator, OrchestratorEvent};
use rates::RateProvider;
use receipt::ReceiptGenerator;
use risk::RiskEngine;
use sambaza_config::BridgeConfig;
use store::TransactionStore;
use webhook::DedupWindow;

/// Capacity of the orchestrator event queue; webhook handlers block once
/// it fills rather than dropping events
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<BridgeConfig>,
    pub dedup: Arc<DedupWindow>,
    pub events: mpsc::Sender<OrchestratorEvent>,
    pub clock: SharedClock,
    /// Present when the service runs on the Postgres store
    pub db: Option<sqlx::PgPool>,
}

impl AppState {
    pub fn with_db(mut self, pool: sqlx::PgPool) -> Self {
        self.db = Some(pool);
        self
    }
}

/// Wire the components into an AppState plus the event queue receiver.
/// Callers (main and the test harness) hand the receiver to
/// `sweeper::spawn_event_worker`.
pub fn build_state(
    config: BridgeConfig,
    store: Arc<dyn TransactionStore>,
    lightning_node: Arc<dyn LightningNode>,
    mpesa_gateway: Arc<dyn MpesaGateway>,
    rates: Arc<RateProvider>,
    clock: SharedClock,
) -> (AppState, mpsc::Receiver<OrchestratorEvent>) {
    let risk = Arc::new(RiskEngine::new(&config.risk));
    let receipts = Arc::new(ReceiptGenerator::new(&config.receipts.hmac_secret));
    let idempotency = Arc::new(IdempotencyIndex::new());

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        lightning_node,
        mpesa_gateway,
        risk,
        receipts,
        idempotency,
        rates,
        clock.clone(),
    ));

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    let state = AppState {
        orchestrator,
        config: Arc::new(config),
        dedup: Arc::new(DedupWindow::new()),
        events: events_tx,
        clock,
        db: None,
    };

    (state, events_rx)
}
