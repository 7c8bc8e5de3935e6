/// Quote engine: fee and limit table plus the sats computation
///
/// A quote is a pure function of the current rate and the per-flow fee
/// table. Once a transaction is created the quote is frozen onto the
/// record and never recomputed.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sambaza_errors::{BridgeError, Result};
use sambaza_types::{Flow, KesAmount, RateQuote, SatAmount};

/// Minutes the invoice and rate lock stay valid
pub const QUOTE_WINDOW_MINUTES: i64 = 15;

/// Fraction of sats added as the Lightning routing fee reserve
const LIGHTNING_FEE_RESERVE: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001

const SATS_PER_BTC: Decimal = Decimal::from_parts(100_000_000, 0, 0, false, 0);

/// Per-flow limits and service fee parameters, amounts in whole KES
#[derive(Debug, Clone, Copy)]
pub struct FlowLimits {
    pub min_kes: i64,
    pub max_kes: i64,
    /// Fee percentage, e.g. 0.025
    pub fee_rate: Decimal,
    pub fee_min_kes: i64,
    pub fee_max_kes: i64,
}

/// The authoritative fee and limit table
pub fn limits(flow: Flow) -> FlowLimits {
    let fee_rate = Decimal::new(25, 3); // 2.5%
    match flow {
        Flow::SendMoney => FlowLimits {
            min_kes: 10,
            max_kes: 150_000,
            fee_rate,
            fee_min_kes: 1,
            fee_max_kes: 1_000,
        },
        Flow::BuyAirtime => FlowLimits {
            min_kes: 5,
            max_kes: 10_000,
            fee_rate,
            fee_min_kes: 1,
            fee_max_kes: 200,
        },
        Flow::Paybill | Flow::BuyGoods | Flow::ScanPay => FlowLimits {
            min_kes: 10,
            max_kes: 150_000,
            fee_rate,
            fee_min_kes: 1,
            fee_max_kes: 1_000,
        },
    }
}

/// A frozen quote, stamped onto the transaction at creation
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub btc_sats: SatAmount,
    pub rate: Decimal,
    pub fee_kes: KesAmount,
    pub valid_until: DateTime<Utc>,
}

/// Service fee for `amount` under the flow's fee parameters
pub fn service_fee(flow: Flow, amount: KesAmount) -> KesAmount {
    let table = limits(flow);
    let fee_cents = (amount.as_decimal() * table.fee_rate * Decimal::new(100, 0))
        .round()
        .to_i64()
        .unwrap_or(i64::MAX);
    let clamped = fee_cents.clamp(table.fee_min_kes * 100, table.fee_max_kes * 100);
    KesAmount::from_cents(clamped)
}

/// Validate the amount against the flow's limits
pub fn check_limits(flow: Flow, amount: KesAmount) -> Result<()> {
    let table = limits(flow);
    let cents = amount.cents();
    if cents < table.min_kes * 100 || cents > table.max_kes * 100 {
        return Err(BridgeError::invalid_input(format!(
            "{flow} amount must be between {} and {} KES",
            table.min_kes, table.max_kes
        )));
    }
    Ok(())
}

/// Produce a frozen quote for `amount` at `rate_quote`
///
/// The payer covers amount + service fee, converted at the locked rate,
/// plus a 0.1% Lightning reserve on the sats side.
pub fn quote(
    flow: Flow,
    amount: KesAmount,
    rate_quote: &RateQuote,
    now: DateTime<Utc>,
) -> Result<Quote> {
    check_limits(flow, amount)?;

    if rate_quote.rate <= Decimal::ZERO {
        return Err(BridgeError::RateUnavailable);
    }

    let fee_kes = service_fee(flow, amount);
    let total_kes = Decimal::new(amount.cents() + fee_kes.cents(), 2);

    let base_sats = (total_kes / rate_quote.rate * SATS_PER_BTC).ceil();
    let reserve = (base_sats * LIGHTNING_FEE_RESERVE).ceil();
    let btc_sats = (base_sats + reserve).to_i64().ok_or_else(|| {
        BridgeError::invalid_input("amount does not convert to a representable sat value")
    })?;

    Ok(Quote {
        btc_sats: SatAmount::new(btc_sats),
        rate: rate_quote.rate,
        fee_kes,
        valid_until: now + Duration::minutes(QUOTE_WINDOW_MINUTES),
    })
}
