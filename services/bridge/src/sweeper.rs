/// Background loops
///
/// Cooperative tokio tasks: the rate poller, the expiry sweeper, the
/// Daraja reconciler, the cache GC, the settlement subscription consumer
/// and the orchestrator event worker. Each loop has a jittered period, a
/// deadline per iteration and a panic-safe outer wrapper; a shutdown
/// signal drains them cooperatively.

use futures::StreamExt;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::orchestrator::{Orchestrator, OrchestratorEvent};

const EXPIRY_SWEEP_SECS: u64 = 5;
const RECONCILE_SECS: u64 = 60;
const CACHE_GC_SECS: u64 = 300;
/// Upper bound for one sweep iteration before it is abandoned
const ITERATION_DEADLINE_SECS: u64 = 30;

/// Run `body` every `period` (+-10% jitter) until shutdown flips.
/// A panicking iteration is logged and the loop continues.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    body: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let jitter = {
            let spread = (period.as_millis() as f64 * 0.1) as i64;
            rand::thread_rng().gen_range(-spread..=spread.max(1))
        };
        let wait = Duration::from_millis((period.as_millis() as i64 + jitter).max(0) as u64);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!(task = name, "background loop stopping");
                    return;
                }
            }
        }

        let iteration = tokio::spawn(tokio::time::timeout(
            Duration::from_secs(ITERATION_DEADLINE_SECS),
            body(),
        ));
        match iteration.await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::warn!(task = name, "iteration deadline elapsed"),
            Err(join_err) if join_err.is_panic() => {
                tracing::error!(task = name, "iteration panicked, loop continues");
            }
            Err(_) => return,
        }
    }
}

/// Expiry sweeper: LIGHTNING_PENDING past its quote window moves to
/// EXPIRED every 5 seconds.
pub fn spawn_expiry_sweeper(
    orchestrator: Arc<Orchestrator>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_periodic(
        "expiry-sweeper",
        Duration::from_secs(EXPIRY_SWEEP_SECS),
        shutdown,
        move || {
            let orchestrator = orchestrator.clone();
            async move {
                if let Err(err) = orchestrator.sweep_expired().await {
                    tracing::error!(error = %err, "expiry sweep failed");
                }
            }
        },
    ))
}

/// Reconciler: every 60 seconds, re-query Daraja for MPESA_PENDING rows
/// older than two minutes and retry stuck refunds.
pub fn spawn_reconciler(
    orchestrator: Arc<Orchestrator>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_periodic(
        "reconciler",
        Duration::from_secs(RECONCILE_SECS),
        shutdown,
        move || {
            let orchestrator = orchestrator.clone();
            async move {
                if let Err(err) = orchestrator.reconcile().await {
                    tracing::error!(error = %err, "reconciliation pass failed");
                }
            }
        },
    ))
}

/// Rate poller: refresh the feed aggregate on the configured period.
pub fn spawn_rate_poller(
    rates: Arc<crate::rates::RateProvider>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_periodic("rate-poller", period, shutdown, move || {
        let rates = rates.clone();
        async move { rates.refresh().await }
    }))
}

/// Cache GC: dedup window, idempotency entries and velocity windows.
pub fn spawn_cache_gc(
    orchestrator: Arc<Orchestrator>,
    dedup: Arc<crate::webhook::DedupWindow>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_periodic(
        "cache-gc",
        Duration::from_secs(CACHE_GC_SECS),
        shutdown,
        move || {
            let orchestrator = orchestrator.clone();
            let dedup = dedup.clone();
            async move {
                let now = orchestrator.clock().now();
                let dropped = dedup.expire(now)
                    + orchestrator.idempotency().expire(now)
                    + orchestrator.risk().velocity().expire(now);
                if dropped > 0 {
                    tracing::debug!(dropped = dropped, "cache GC swept entries");
                }
            }
        },
    ))
}

/// Event worker: drains the orchestrator queue until every sender is gone.
pub fn spawn_event_worker(
    orchestrator: Arc<Orchestrator>,
    mut events: mpsc::Receiver<OrchestratorEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Err(err) = orchestrator.handle_event(event).await {
                tracing::error!(error = %err, "event handling failed");
            }
        }
        tracing::info!("event worker drained and stopped");
    })
}

/// Settlement subscription consumer: resubscribes from the last acked
/// sequence number after any stream failure.
pub fn spawn_settlement_consumer(
    orchestrator: Arc<Orchestrator>,
    lightning: Arc<dyn crate::lightning::LightningNode>,
    events: mpsc::Sender<OrchestratorEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let from_seq = orchestrator.last_acked_seq();
            let mut stream = match lightning.subscribe_settlements(from_seq).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(error = %err, "settlement subscription failed, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            loop {
                tokio::select! {
                    settlement = stream.next() => {
                        let Some(settlement) = settlement else { break };
                        let event = OrchestratorEvent::InvoiceSettled {
                            payment_hash: settlement.payment_hash,
                            amount_sats: settlement.amount_sats,
                            settled_at: settlement.settled_at,
                            seq: Some(settlement.seq),
                        };
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("settlement consumer stopping");
                            return;
                        }
                    }
                }
            }

            tracing::warn!("settlement stream ended, resubscribing");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_periodic_loop_survives_panics() {
        let counter = Arc::new(AtomicU32::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let counter_for_loop = counter.clone();
        let handle = tokio::spawn(run_periodic(
            "panicky",
            Duration::from_millis(5),
            shutdown_rx,
            move || {
                let counter = counter_for_loop.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        panic!("first iteration dies");
                    }
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(counter.load(Ordering::SeqCst) >= 2, "loop stopped after the panic");
    }

    #[tokio::test]
    async fn test_periodic_loop_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_periodic(
            "idle",
            Duration::from_secs(3600),
            shutdown_rx,
            || async {},
        ));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop on shutdown")
            .unwrap();
    }
}
