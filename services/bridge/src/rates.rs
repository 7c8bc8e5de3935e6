/// BTC/KES rate provider
///
/// Three upstream price feeds are polled in parallel every 10 seconds with
/// a 5 second deadline each. The published mid is the trimmed mean of the
/// successful responses; fewer than two successes marks the provider
/// unhealthy and the last-known value keeps serving until it is 60 seconds
/// old, after which quote requests fail with RateUnavailable.
///
/// Quotes carry the configured spread already applied and are valid for
/// 60 seconds, independent of the invoice expiry window.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use sambaza_config::RateConfig;
use sambaza_errors::{BridgeError, Result};
use sambaza_types::RateQuote;
use std::sync::Arc;

use crate::clock::SharedClock;

/// Seconds a fetched rate may keep serving after its fetch
const RATE_MAX_AGE_SECS: i64 = 60;
/// Seconds a published quote stays valid
const QUOTE_VALIDITY_SECS: i64 = 60;

/// One upstream price source
#[async_trait]
pub trait RateFeed: Send + Sync {
    fn name(&self) -> &str;
    /// Current BTC/KES mid from this source
    async fn fetch(&self) -> Result<Decimal>;
}

/// HTTP price feed returning JSON with a rate field
pub struct HttpRateFeed {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpRateFeed {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { name: name.into(), url: url.into(), client }
    }

    /// Feeds disagree on the field name; accept the common spellings.
    fn extract_rate(body: &serde_json::Value) -> Option<Decimal> {
        for field in ["rate", "btc_kes", "price", "last"] {
            if let Some(v) = body.get(field) {
                if let Some(s) = v.as_str() {
                    if let Ok(d) = s.parse::<Decimal>() {
                        return Some(d);
                    }
                }
                if let Some(f) = v.as_f64() {
                    return Decimal::try_from(f).ok();
                }
            }
        }
        None
    }
}

#[async_trait]
impl RateFeed for HttpRateFeed {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Decimal> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| BridgeError::UpstreamTransient {
                service: "rate-feed",
                message: format!("{}: {e}", self.name),
            })?;

        if !response.status().is_success() {
            return Err(BridgeError::UpstreamTransient {
                service: "rate-feed",
                message: format!("{}: HTTP {}", self.name, response.status()),
            });
        }

        let body: serde_json::Value =
            response.json().await.map_err(|e| BridgeError::UpstreamTransient {
                service: "rate-feed",
                message: format!("{}: {e}", self.name),
            })?;

        let rate = Self::extract_rate(&body).ok_or_else(|| BridgeError::UpstreamTransient {
            service: "rate-feed",
            message: format!("{}: no rate field in response", self.name),
        })?;

        if rate <= Decimal::ZERO {
            return Err(BridgeError::UpstreamTransient {
                service: "rate-feed",
                message: format!("{}: non-positive rate {rate}", self.name),
            });
        }

        Ok(rate)
    }
}

#[derive(Debug, Clone)]
struct CachedRate {
    /// Mid rate before spread
    mid: Decimal,
    source: String,
    fetched_at: DateTime<Utc>,
}

/// Health snapshot for the /health endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct RateProviderHealth {
    pub status: String,
    pub last_fetch_age_secs: Option<i64>,
}

pub struct RateProvider {
    feeds: Vec<Arc<dyn RateFeed>>,
    spread: Decimal,
    feed_timeout: std::time::Duration,
    cache: Mutex<Option<CachedRate>>,
    clock: SharedClock,
}

impl RateProvider {
    pub fn new(feeds: Vec<Arc<dyn RateFeed>>, spread: Decimal, feed_timeout: std::time::Duration, clock: SharedClock) -> Self {
        Self { feeds, spread, feed_timeout, cache: Mutex::new(None), clock }
    }

    pub fn from_config(config: &RateConfig, clock: SharedClock) -> Self {
        let timeout = std::time::Duration::from_secs(config.feed_timeout_secs);
        let feeds: Vec<Arc<dyn RateFeed>> = config
            .feed_urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                Arc::new(HttpRateFeed::new(format!("feed-{i}"), url.clone(), timeout))
                    as Arc<dyn RateFeed>
            })
            .collect();
        Self::new(feeds, config.spread, timeout, clock)
    }

    /// Poll all feeds once and fold the successes into the cache.
    pub async fn refresh(&self) {
        let fetches = self.feeds.iter().map(|feed| {
            let feed = feed.clone();
            let deadline = self.feed_timeout;
            async move {
                match tokio::time::timeout(deadline, feed.fetch()).await {
                    Ok(Ok(rate)) => Some((feed.name().to_string(), rate)),
                    Ok(Err(err)) => {
                        tracing::warn!(feed = feed.name(), error = %err, "rate feed failed");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(feed = feed.name(), "rate feed deadline elapsed");
                        None
                    }
                }
            }
        });

        let results: Vec<(String, Decimal)> =
            futures::future::join_all(fetches).await.into_iter().flatten().collect();

        if results.len() < 2 {
            tracing::warn!(
                succeeded = results.len(),
                feeds = self.feeds.len(),
                "rate provider unhealthy, serving last-known value"
            );
            return;
        }

        let mid = trimmed_mean(results.iter().map(|(_, r)| *r).collect());
        let source = format!("trimmed-mean({})", results.len());
        let now = self.clock.now();

        tracing::debug!(mid = %mid, source = %source, "rate refreshed");
        *self.cache.lock() = Some(CachedRate { mid, source, fetched_at: now });
    }

    /// Current quote with spread applied, or StaleRate when the cache has
    /// aged out.
    pub fn current(&self) -> Result<RateQuote> {
        let now = self.clock.now();
        let cache = self.cache.lock();

        let cached = cache.as_ref().ok_or(BridgeError::RateUnavailable)?;
        if now - cached.fetched_at > Duration::seconds(RATE_MAX_AGE_SECS) {
            return Err(BridgeError::RateUnavailable);
        }

        let rate = cached.mid * (Decimal::ONE + self.spread);
        Ok(RateQuote {
            pair: "BTC/KES".to_string(),
            rate,
            spread: self.spread,
            source: cached.source.clone(),
            valid_from: now,
            valid_until: now + Duration::seconds(QUOTE_VALIDITY_SECS),
        })
    }

    pub fn health(&self) -> RateProviderHealth {
        let now = self.clock.now();
        let cache = self.cache.lock();
        match cache.as_ref() {
            Some(cached) => {
                let age = (now - cached.fetched_at).num_seconds();
                let status = if age <= RATE_MAX_AGE_SECS { "healthy" } else { "stale" };
                RateProviderHealth { status: status.to_string(), last_fetch_age_secs: Some(age) }
            }
            None => RateProviderHealth { status: "cold".to_string(), last_fetch_age_secs: None },
        }
    }
}

/// Mean with the extremes dropped once there are three or more samples
fn trimmed_mean(mut rates: Vec<Decimal>) -> Decimal {
    rates.sort();
    let trimmed: &[Decimal] = if rates.len() >= 3 { &rates[1..rates.len() - 1] } else { &rates };
    let sum: Decimal = trimmed.iter().copied().sum();
    sum / Decimal::from(trimmed.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StaticFeed {
        name: String,
        rate: Decimal,
        fail: AtomicBool,
    }

    impl StaticFeed {
        fn new(name: &str, rate: i64) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                rate: Decimal::new(rate, 0),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl RateFeed for StaticFeed {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch(&self) -> Result<Decimal> {
            if self.fail.load(Ordering::SeqCst) {
                Err(BridgeError::UpstreamTransient {
                    service: "rate-feed",
                    message: "down".to_string(),
                })
            } else {
                Ok(self.rate)
            }
        }
    }

    fn manual_clock() -> (ManualClock, SharedClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        let shared: SharedClock = Arc::new(clock.clone());
        (clock, shared)
    }

    #[test]
    fn test_trimmed_mean_drops_extremes() {
        let rates = vec![Decimal::new(100, 0), Decimal::new(110, 0), Decimal::new(900, 0)];
        assert_eq!(trimmed_mean(rates), Decimal::new(110, 0));

        let two = vec![Decimal::new(100, 0), Decimal::new(110, 0)];
        assert_eq!(trimmed_mean(two), Decimal::new(105, 0));
    }

    #[tokio::test]
    async fn test_spread_is_applied() {
        let (_, clock) = manual_clock();
        let feeds: Vec<Arc<dyn RateFeed>> = vec![
            StaticFeed::new("a", 10_000_000),
            StaticFeed::new("b", 10_000_000),
            StaticFeed::new("c", 10_000_000),
        ];
        let provider = RateProvider::new(
            feeds,
            Decimal::new(5, 3),
            std::time::Duration::from_secs(5),
            clock,
        );

        provider.refresh().await;
        let quote = provider.current().unwrap();
        assert_eq!(quote.rate, Decimal::new(10_050_000, 0));
        assert_eq!(quote.spread, Decimal::new(5, 3));
    }

    #[tokio::test]
    async fn test_single_feed_success_keeps_last_known() {
        let (_, clock) = manual_clock();
        let a = StaticFeed::new("a", 10_000_000);
        let b = StaticFeed::new("b", 10_000_000);
        let c = StaticFeed::new("c", 10_000_000);
        let feeds: Vec<Arc<dyn RateFeed>> = vec![a.clone(), b.clone(), c.clone()];
        let provider =
            RateProvider::new(feeds, Decimal::ZERO, std::time::Duration::from_secs(5), clock);

        provider.refresh().await;
        assert!(provider.current().is_ok());

        // Two of three feeds go down; the refresh must not clobber the cache
        b.fail.store(true, Ordering::SeqCst);
        c.fail.store(true, Ordering::SeqCst);
        provider.refresh().await;
        assert!(provider.current().is_ok());
    }

    #[tokio::test]
    async fn test_stale_cache_fails_quotes() {
        let (manual, clock) = manual_clock();
        let feeds: Vec<Arc<dyn RateFeed>> =
            vec![StaticFeed::new("a", 10_000_000), StaticFeed::new("b", 10_000_000)];
        let provider =
            RateProvider::new(feeds, Decimal::ZERO, std::time::Duration::from_secs(5), clock);

        provider.refresh().await;
        assert!(provider.current().is_ok());

        manual.advance(Duration::seconds(61));
        assert!(matches!(provider.current(), Err(BridgeError::RateUnavailable)));
    }

    #[tokio::test]
    async fn test_cold_provider_has_no_rate() {
        let (_, clock) = manual_clock();
        let provider =
            RateProvider::new(vec![], Decimal::ZERO, std::time::Duration::from_secs(5), clock);
        assert!(matches!(provider.current(), Err(BridgeError::RateUnavailable)));
        assert_eq!(provider.health().status, "cold");
    }

    #[test]
    fn test_extract_rate_field_variants() {
        for body in [
            serde_json::json!({"rate": 11500000.0}),
            serde_json::json!({"btc_kes": "11500000"}),
            serde_json::json!({"price": 11500000}),
        ] {
            assert!(HttpRateFeed::extract_rate(&body).is_some(), "failed for {body}");
        }
        assert!(HttpRateFeed::extract_rate(&serde_json::json!({"other": 1})).is_none());
    }
}
