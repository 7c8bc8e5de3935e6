/// Risk engine
///
/// Scores a transaction against velocity, amount, geography and device
/// signals. Evaluation happens at the LIGHTNING_PAID -> CONVERTING
/// boundary: scoring earlier would let an attacker probe the function
/// without paying for an invoice first. A BLOCK decision after settlement
/// routes the transaction to REFUNDING instead of the payout.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sambaza_config::RiskConfig;
use sambaza_types::{KesAmount, RiskAssessment, RiskDecision, Transaction};
use std::collections::HashMap;

use crate::quote;

const FLAG_THRESHOLD: f64 = 0.7;
const BLOCK_THRESHOLD: f64 = 0.8;

const BOT_PATTERNS: [&str; 6] = ["bot", "crawler", "spider", "scraper", "curl", "wget"];

/// Dial prefixes for the countries the engine can be configured to score
fn dial_prefix(iso: &str) -> Option<&'static str> {
    match iso {
        "AF" => Some("93"),
        "IR" => Some("98"),
        "KP" => Some("850"),
        "SY" => Some("963"),
        "SO" => Some("252"),
        "SS" => Some("211"),
        "YE" => Some("967"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    at: DateTime<Utc>,
    kes: KesAmount,
}

/// Sliding-window bookkeeping behind the velocity signals
///
/// Observations are recorded at create time and consulted at evaluation
/// time; windows older than 24 hours are dropped by the GC sweeper.
#[derive(Default)]
pub struct VelocityTracker {
    by_ip: Mutex<HashMap<String, Vec<Observation>>>,
    by_msisdn: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl VelocityTracker {
    pub fn record(&self, source_ip: &str, msisdn: &str, kes: KesAmount, at: DateTime<Utc>) {
        if !source_ip.is_empty() {
            self.by_ip
                .lock()
                .entry(source_ip.to_string())
                .or_default()
                .push(Observation { at, kes });
        }
        self.by_msisdn.lock().entry(msisdn.to_string()).or_default().push(at);
    }

    fn ip_count_within(&self, source_ip: &str, window: Duration, now: DateTime<Utc>) -> usize {
        self.by_ip
            .lock()
            .get(source_ip)
            .map(|obs| obs.iter().filter(|o| now - o.at <= window).count())
            .unwrap_or(0)
    }

    /// KES cents observed from this IP on the current UTC day.
    fn ip_volume_today(&self, source_ip: &str, now: DateTime<Utc>) -> i64 {
        let today = now.date_naive();
        self.by_ip
            .lock()
            .get(source_ip)
            .map(|obs| {
                obs.iter()
                    .filter(|o| o.at.date_naive() == today)
                    .map(|o| o.kes.cents())
                    .sum()
            })
            .unwrap_or(0)
    }

    fn msisdn_count_within(&self, msisdn: &str, window: Duration, now: DateTime<Utc>) -> usize {
        self.by_msisdn
            .lock()
            .get(msisdn)
            .map(|ts| ts.iter().filter(|t| now - **t <= window).count())
            .unwrap_or(0)
    }

    /// Drop observations older than 24 hours. Returns how many went.
    pub fn expire(&self, now: DateTime<Utc>) -> usize {
        let window = Duration::hours(24);
        let mut dropped = 0;

        let mut by_ip = self.by_ip.lock();
        for obs in by_ip.values_mut() {
            let before = obs.len();
            obs.retain(|o| now - o.at <= window);
            dropped += before - obs.len();
        }
        by_ip.retain(|_, obs| !obs.is_empty());

        let mut by_msisdn = self.by_msisdn.lock();
        for ts in by_msisdn.values_mut() {
            let before = ts.len();
            ts.retain(|t| now - *t <= window);
            dropped += before - ts.len();
        }
        by_msisdn.retain(|_, ts| !ts.is_empty());

        dropped
    }
}

pub struct RiskEngine {
    velocity: VelocityTracker,
    blocked_prefixes: Vec<&'static str>,
    /// Per-IP daily volume limit in KES cents
    daily_limit_cents: i64,
}

impl RiskEngine {
    pub fn new(config: &RiskConfig) -> Self {
        let blocked_prefixes =
            config.blocked_countries.iter().filter_map(|iso| dial_prefix(iso)).collect();
        Self {
            velocity: VelocityTracker::default(),
            blocked_prefixes,
            daily_limit_cents: config.daily_limit_kes * 100,
        }
    }

    /// Record a created transaction into the velocity windows.
    pub fn observe_created(&self, tx: &Transaction) {
        self.velocity.record(
            &tx.origin.source_ip,
            tx.recipient_phone.as_str(),
            tx.kes_amount,
            tx.created_at,
        );
    }

    pub fn velocity(&self) -> &VelocityTracker {
        &self.velocity
    }

    /// Score `tx` and decide. Signals are additive, clamped to 1.0.
    pub fn score(&self, tx: &Transaction, now: DateTime<Utc>) -> RiskAssessment {
        let mut score: f64 = 0.0;
        let mut factors = Vec::new();

        let cap_cents = quote::limits(tx.flow).max_kes * 100;
        let amount = tx.kes_amount.cents();
        if amount > cap_cents {
            score += 0.40;
            factors.push("amount over flow cap".to_string());
        } else if amount as f64 > 0.9 * cap_cents as f64 {
            score += 0.10;
            factors.push("amount near flow cap".to_string());
        }

        // Structuring heuristic: large round figures
        if amount >= 100_000 * 100 && amount % (10_000 * 100) == 0 {
            score += 0.20;
            factors.push("round amount at or above 100k KES".to_string());
        }

        let ip = &tx.origin.source_ip;
        if !ip.is_empty() {
            let hourly = self.velocity.ip_count_within(ip, Duration::hours(1), now);
            if hourly >= 5 {
                score += 0.30;
                factors.push(format!("{hourly} transactions from IP in the last hour"));
            }

            let volume_today = self.velocity.ip_volume_today(ip, now);
            if volume_today > self.daily_limit_cents {
                score += 0.40;
                factors.push(format!(
                    "daily volume {} KES over limit {}",
                    volume_today / 100,
                    self.daily_limit_cents / 100
                ));
            }
        }

        let msisdn_daily = self.velocity.msisdn_count_within(
            tx.recipient_phone.as_str(),
            Duration::hours(24),
            now,
        );
        if msisdn_daily >= 3 {
            score += 0.20;
            factors.push(format!("{msisdn_daily} transactions to MSISDN in 24h"));
        }

        let ua = tx.origin.user_agent.to_lowercase();
        if BOT_PATTERNS.iter().any(|p| ua.contains(p)) {
            score += 0.20;
            factors.push("automated user agent".to_string());
        }

        if self
            .blocked_prefixes
            .iter()
            .any(|prefix| tx.recipient_phone.as_str().starts_with(prefix))
        {
            score += 0.30;
            factors.push("MSISDN in high-risk country set".to_string());
        }

        let score = score.min(1.0);
        let decision = if score >= BLOCK_THRESHOLD {
            RiskDecision::Block
        } else if score >= FLAG_THRESHOLD {
            RiskDecision::Flag
        } else {
            RiskDecision::Allow
        };

        RiskAssessment { score, factors, decision }
    }
}
