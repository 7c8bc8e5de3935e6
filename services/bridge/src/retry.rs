/// Retry policies for outbound side effects
///
/// Two ladders are used in the bridge: a fast one for invoice creation
/// (100 ms doubling, capped at 5 s, 5 attempts) and the general one for
/// Daraja dispatch and refunds (200 ms doubling with jitter, capped at
/// 30 s, 5 attempts). Only transient errors consume the budget; permanent
/// errors abort immediately.

use rand::Rng;
use sambaza_errors::{BridgeError, Result};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
    /// Fractional jitter applied to each wait, e.g. 0.2 for +-20%
    pub jitter: f64,
}

impl RetryPolicy {
    /// Invoice creation: 100 ms, 200 ms, 400 ms, ... capped at 5 s.
    pub fn invoice_creation() -> Self {
        Self {
            initial: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            max_attempts: 5,
            jitter: 0.0,
        }
    }

    /// General side effects: base 200 ms, factor 2, jitter +-20%, cap 30 s.
    pub fn side_effect() -> Self {
        Self {
            initial: Duration::from_millis(200),
            cap: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.2,
        }
    }

    /// Backoff wait before attempt `attempt` (0-based; no wait before 0).
    pub fn wait_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempt - 1);
        let base_ms = (self.initial.as_millis() as u64).saturating_mul(factor);
        let capped_ms = base_ms.min(self.cap.as_millis() as u64);
        if self.jitter == 0.0 {
            return Duration::from_millis(capped_ms);
        }
        let spread = (capped_ms as f64 * self.jitter) as i64;
        let jittered = capped_ms as i64 + rand::thread_rng().gen_range(-spread..=spread.max(1));
        Duration::from_millis(jittered.max(0) as u64)
    }
}

/// Run `op` under `policy`, retrying transient failures
///
/// The last error is returned once the budget is exhausted. Permanent
/// errors short-circuit without consuming further attempts.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err: Option<BridgeError> = None;

    for attempt in 0..policy.max_attempts {
        let wait = policy.wait_before(attempt);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    operation = operation,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "transient failure, will retry"
                );
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        BridgeError::Internal(anyhow::anyhow!("retry budget exhausted for {operation}"))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_ladder_doubles_and_caps() {
        let policy = RetryPolicy::invoice_creation();
        assert_eq!(policy.wait_before(0), Duration::ZERO);
        assert_eq!(policy.wait_before(1), Duration::from_millis(100));
        assert_eq!(policy.wait_before(2), Duration::from_millis(200));
        assert_eq!(policy.wait_before(3), Duration::from_millis(400));
        // Far past the cap
        assert_eq!(policy.wait_before(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::side_effect();
        for _ in 0..50 {
            let wait = policy.wait_before(3).as_millis() as i64;
            // 800 ms nominal, +-20%
            assert!((640..=961).contains(&wait), "wait {wait}ms out of jitter bounds");
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            initial: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_attempts: 5,
            jitter: 0.0,
        };

        let result = retry(policy, "test-op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BridgeError::daraja_transient("503"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            initial: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_attempts: 5,
            jitter: 0.0,
        };

        let result: Result<()> = retry(policy, "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BridgeError::daraja_permanent("invalid msisdn")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_returns_last_error() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(1),
            cap: Duration::from_millis(1),
            max_attempts: 3,
            jitter: 0.0,
        };

        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(policy, "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BridgeError::lightning_transient("timeout")) }
        })
        .await;

        assert!(matches!(result, Err(BridgeError::UpstreamTransient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
