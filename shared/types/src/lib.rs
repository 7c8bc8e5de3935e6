/// Shared types used across the Sambaza bridge
///
/// This library defines the core business concepts of the bridge: product
/// flows, transaction states, money amounts, and the transaction aggregate
/// itself. Centralizing these types keeps every component speaking the same
/// vocabulary.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod state;
mod transaction;

pub use state::*;
pub use transaction::*;

/// Unique identifier for a bridge transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 32-byte Lightning payment hash, stored lowercase hex
///
/// This is the canonical transaction key: the invoice, the Daraja account
/// reference and the receipt all correlate back through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct PaymentHash(String);

impl PaymentHash {
    pub fn parse(hex_str: &str) -> Result<Self, String> {
        let lowered = hex_str.to_ascii_lowercase();
        if lowered.len() != 64 || !lowered.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err("payment hash must be 32 bytes of hex".to_string());
        }
        Ok(Self(lowered))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading 12 hex chars, the slot Daraja allows for an account reference.
    /// Callbacks are correlated back to the transaction through this.
    pub fn account_reference(&self) -> &str {
        &self.0[..12]
    }
}

impl std::fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kenyan MSISDN normalised to E.164 without the plus: 254XXXXXXXXX
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct Msisdn(String);

impl Msisdn {
    /// Accepts "+254712345678", "254712345678" or "0712345678" and
    /// normalises to the 254XXXXXXXXX form Daraja expects.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        let normalised = if digits.len() == 12 && digits.starts_with("254") {
            digits
        } else if digits.len() == 10 && digits.starts_with('0') {
            format!("254{}", &digits[1..])
        } else if digits.len() == 9 && (digits.starts_with('7') || digits.starts_with('1')) {
            format!("254{}", digits)
        } else {
            return Err(format!("not a Kenyan mobile number: {raw}"));
        };
        Ok(Self(normalised))
    }

    /// Constructs without Kenyan normalisation. Used by the risk engine
    /// tests and anywhere a foreign number must be representable.
    pub fn raw(digits: String) -> Self {
        Self(digits)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Msisdn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An amount of Kenyan Shillings, stored as integer cents
///
/// Integer cents avoid floating point drift in financial arithmetic; the
/// public API speaks whole KES and converts at the boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct KesAmount(pub i64);

impl KesAmount {
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub fn from_kes(kes: i64) -> Self {
        Self(kes * 100)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    /// Whole KES, rounding down. Display and limit checks only.
    pub fn kes(&self) -> i64 {
        self.0 / 100
    }

    pub fn as_decimal(&self) -> Decimal {
        Decimal::new(self.0, 2)
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(&self, other: KesAmount) -> Option<KesAmount> {
        self.0.checked_add(other.0).map(KesAmount)
    }
}

impl std::fmt::Display for KesAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KES {}.{:02}", self.0 / 100, (self.0 % 100).abs())
    }
}

/// An amount in Bitcoin satoshis (1 BTC = 100,000,000 sats)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct SatAmount(pub i64);

impl SatAmount {
    pub fn new(sats: i64) -> Self {
        Self(sats)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn sats(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

/// BOLT11 payment request handed to the payer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct LightningInvoice(pub String);

/// Daraja-assigned receipt number, e.g. "MPE123ABC45"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct MpesaReceipt(pub String);

/// The five product flows the bridge supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "flow", rename_all = "snake_case")]
pub enum Flow {
    /// Push KES to a recipient MSISDN (Daraja B2C)
    SendMoney,
    /// Top up a recipient MSISDN with airtime (Daraja B2C)
    BuyAirtime,
    /// Pay a paybill with an account number (STK-Push)
    Paybill,
    /// Pay a till / buy goods (STK-Push)
    BuyGoods,
    /// Till payment initiated from a scanned code (STK-Push)
    ScanPay,
}

impl Flow {
    pub const ALL: [Flow; 5] = [
        Flow::SendMoney,
        Flow::BuyAirtime,
        Flow::Paybill,
        Flow::BuyGoods,
        Flow::ScanPay,
    ];

    /// STK-Push flows prompt the payer handset; the rest disburse via B2C.
    pub fn uses_stk_push(&self) -> bool {
        matches!(self, Flow::Paybill | Flow::BuyGoods | Flow::ScanPay)
    }

    pub fn requires_merchant_code(&self) -> bool {
        matches!(self, Flow::Paybill | Flow::BuyGoods)
    }

    pub fn requires_account_number(&self) -> bool {
        matches!(self, Flow::Paybill)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Flow::SendMoney => "SEND_MONEY",
            Flow::BuyAirtime => "BUY_AIRTIME",
            Flow::Paybill => "PAYBILL",
            Flow::BuyGoods => "BUY_GOODS",
            Flow::ScanPay => "SCAN_PAY",
        }
    }
}

impl std::fmt::Display for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A BTC/KES rate quote published by the rate provider
///
/// Never mutated after creation; short-lived, and copied onto the
/// transaction when the quote is locked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateQuote {
    /// Currency pair, always "BTC/KES" today
    pub pair: String,
    /// KES per BTC with the spread already applied
    pub rate: Decimal,
    /// Spread that was applied, e.g. 0.005
    pub spread: Decimal,
    /// Aggregation source label, e.g. "trimmed-mean(3)"
    pub source: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl RateQuote {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        at < self.valid_until
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_hash_parsing() {
        let hex64 = "a".repeat(64);
        let hash = PaymentHash::parse(&hex64).unwrap();
        assert_eq!(hash.account_reference().len(), 12);

        assert!(PaymentHash::parse("abc").is_err());
        assert!(PaymentHash::parse(&"z".repeat(64)).is_err());

        // Uppercase input normalises to lowercase
        let upper = PaymentHash::parse(&"AB".repeat(32)).unwrap();
        assert_eq!(upper.as_str(), "ab".repeat(32));
    }

    #[test]
    fn test_msisdn_normalisation() {
        for raw in ["+254712345678", "254712345678", "0712345678", "712345678"] {
            assert_eq!(Msisdn::parse(raw).unwrap().as_str(), "254712345678");
        }
        assert!(Msisdn::parse("12345").is_err());
        assert!(Msisdn::parse("+14155550123").is_err());
    }

    #[test]
    fn test_kes_amount_units() {
        let amount = KesAmount::from_kes(1000);
        assert_eq!(amount.cents(), 100_000);
        assert_eq!(amount.kes(), 1000);
        assert_eq!(amount.to_string(), "KES 1000.00");
        assert_eq!(amount.as_decimal().to_string(), "1000.00");
    }

    #[test]
    fn test_flow_dispatch_channel() {
        assert!(!Flow::SendMoney.uses_stk_push());
        assert!(!Flow::BuyAirtime.uses_stk_push());
        assert!(Flow::Paybill.uses_stk_push());
        assert!(Flow::BuyGoods.uses_stk_push());
        assert!(Flow::ScanPay.uses_stk_push());

        assert!(Flow::Paybill.requires_account_number());
        assert!(!Flow::BuyGoods.requires_account_number());
    }
}
