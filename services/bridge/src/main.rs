/// Sambaza bridge entry point
///
/// Boots the store, adapters and background loops, then serves the API
/// and webhook surfaces from one listener. Shutdown is graceful: new
/// creates stop, in-flight transitions drain, loops stop on the signal.

use sambaza_bridge::{
    api, build_state,
    clock::{SharedClock, SystemClock},
    lightning::LndRestClient,
    mpesa::DarajaClient,
    rates::RateProvider,
    store::PgTransactionStore,
    sweeper,
};
use sambaza_config::BridgeConfig;
use sambaza_errors::Result;
use sambaza_tracing::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("sambaza-bridge");

    let config = BridgeConfig::from_env()?;
    if config.is_production() {
        config.validate_production()?;
    }

    let clock: SharedClock = Arc::new(SystemClock);

    let pool = sambaza_database::init(&config.database).await?;
    let store = Arc::new(PgTransactionStore::new(pool.clone()));

    let lightning = Arc::new(LndRestClient::new(&config.lightning));
    let mpesa = Arc::new(DarajaClient::new(config.daraja.clone(), clock.clone()));
    let rates = Arc::new(RateProvider::from_config(&config.rates, clock.clone()));

    // Prime the rate cache before accepting quote requests
    rates.refresh().await;

    let rate_poll_period = Duration::from_secs(config.rates.poll_interval_secs);
    let port = config.app.port;
    let (state, events_rx) =
        build_state(config, store, lightning.clone(), mpesa, rates.clone(), clock);
    let state = state.with_db(pool);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let event_worker = sweeper::spawn_event_worker(state.orchestrator.clone(), events_rx);
    sweeper::spawn_expiry_sweeper(state.orchestrator.clone(), shutdown_rx.clone());
    sweeper::spawn_reconciler(state.orchestrator.clone(), shutdown_rx.clone());
    sweeper::spawn_rate_poller(rates, rate_poll_period, shutdown_rx.clone());
    sweeper::spawn_cache_gc(state.orchestrator.clone(), state.dedup.clone(), shutdown_rx.clone());
    sweeper::spawn_settlement_consumer(
        state.orchestrator.clone(),
        lightning,
        state.events.clone(),
        shutdown_rx,
    );

    let app = api::build_router(state.clone());

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await.map_err(anyhow::Error::new)?;
    info!("Sambaza bridge listening on {addr}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(anyhow::Error::new)?;

    // Stop the loops, then give the event worker a bounded drain window
    shutdown_tx.send(true).ok();
    drop(state);
    if tokio::time::timeout(Duration::from_secs(30), event_worker).await.is_err() {
        tracing::warn!("event worker did not drain within the shutdown window");
    }

    info!("Sambaza bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
