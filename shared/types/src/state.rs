/// Transaction lifecycle states and the canonical transition graph
///
/// Every state change in the bridge is validated against this table before
/// it is committed. The store refuses anything not listed here, so the graph
/// below is the single source of truth for the lifecycle.

use serde::{Deserialize, Serialize};

/// Where a transaction is in its quote -> invoice -> settle -> payout life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "tx_state", rename_all = "snake_case")]
pub enum TxState {
    /// Record created, invoice not yet minted
    Pending,
    /// Lightning invoice issued, waiting for the payer
    LightningPending,
    /// Invoice settled, risk evaluation pending
    LightningPaid,
    /// Risk passed, rate locked, about to dispatch to Daraja
    Converting,
    /// Daraja accepted the dispatch, waiting for its callback
    MpesaPending,
    /// Payout confirmed by Daraja
    Completed,
    /// Payout failed (pre- or post-settlement)
    Failed,
    /// Inbound sats are being returned to the payer
    Refunding,
    /// Refund confirmed
    Refunded,
    /// Quote window elapsed before the invoice settled
    Expired,
    /// Cancelled by the client before settlement
    Cancelled,
}

impl TxState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxState::Completed | TxState::Refunded | TxState::Expired | TxState::Cancelled
        )
    }

    /// The exhaustive set of allowed transitions.
    pub fn can_transition_to(&self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Pending, LightningPending)
                | (Pending, Cancelled)
                | (LightningPending, LightningPaid)
                | (LightningPending, Expired)
                | (LightningPending, Cancelled)
                | (LightningPaid, Converting)
                | (LightningPaid, Refunding)
                | (Converting, MpesaPending)
                | (Converting, Failed)
                | (MpesaPending, Completed)
                | (MpesaPending, Failed)
                | (Failed, Refunding)
                | (Refunding, Refunded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Pending => "PENDING",
            TxState::LightningPending => "LIGHTNING_PENDING",
            TxState::LightningPaid => "LIGHTNING_PAID",
            TxState::Converting => "CONVERTING",
            TxState::MpesaPending => "MPESA_PENDING",
            TxState::Completed => "COMPLETED",
            TxState::Failed => "FAILED",
            TxState::Refunding => "REFUNDING",
            TxState::Refunded => "REFUNDED",
            TxState::Expired => "EXPIRED",
            TxState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable failure classification carried on FAILED transactions
///
/// These are the values clients see; free-form detail travels next to the
/// enum and provider stack traces never leak through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Lightning invoice could not be created after retries
    InvoiceCreationFailed,
    /// Daraja rejected the dispatch synchronously
    DarajaRejected,
    /// Daraja callback carried a non-zero result code
    DarajaResultError,
    /// Retry budget against an upstream exhausted
    UpstreamExhausted,
    /// Risk engine vetoed the payout
    RiskBlocked,
    /// Refund to the payer could not be completed
    RefundFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::InvoiceCreationFailed => "INVOICE_CREATION_FAILED",
            FailureReason::DarajaRejected => "DARAJA_REJECTED",
            FailureReason::DarajaResultError => "DARAJA_RESULT_ERROR",
            FailureReason::UpstreamExhausted => "UPSTREAM_EXHAUSTED",
            FailureReason::RiskBlocked => "RISK_BLOCKED",
            FailureReason::RefundFailed => "REFUND_FAILED",
        }
    }
}

impl std::str::FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INVOICE_CREATION_FAILED" => Ok(FailureReason::InvoiceCreationFailed),
            "DARAJA_REJECTED" => Ok(FailureReason::DarajaRejected),
            "DARAJA_RESULT_ERROR" => Ok(FailureReason::DarajaResultError),
            "UPSTREAM_EXHAUSTED" => Ok(FailureReason::UpstreamExhausted),
            "RISK_BLOCKED" => Ok(FailureReason::RiskBlocked),
            "REFUND_FAILED" => Ok(FailureReason::RefundFailed),
            other => Err(format!("unknown failure reason: {other}")),
        }
    }
}

/// Failure reason plus a short human description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub detail: String,
}

impl Failure {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self { reason, detail: detail.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TxState::*;

    #[test]
    fn test_terminal_states_accept_nothing() {
        for terminal in [Completed, Refunded, Expired, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                Pending,
                LightningPending,
                LightningPaid,
                Converting,
                MpesaPending,
                Completed,
                Failed,
                Refunding,
                Refunded,
                Expired,
                Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next} must be illegal");
            }
        }
    }

    #[test]
    fn test_happy_path_is_legal() {
        let path = [Pending, LightningPending, LightningPaid, Converting, MpesaPending, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {} must be legal", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_refund_path_is_legal() {
        assert!(Failed.can_transition_to(Refunding));
        assert!(LightningPaid.can_transition_to(Refunding));
        assert!(Refunding.can_transition_to(Refunded));
    }

    #[test]
    fn test_no_skipping_settlement() {
        assert!(!LightningPending.can_transition_to(Converting));
        assert!(!LightningPending.can_transition_to(MpesaPending));
        assert!(!Pending.can_transition_to(LightningPaid));
        assert!(!Converting.can_transition_to(Completed));
    }

    #[test]
    fn test_no_cancel_after_settlement() {
        assert!(!LightningPaid.can_transition_to(Cancelled));
        assert!(!Converting.can_transition_to(Cancelled));
        assert!(!MpesaPending.can_transition_to(Cancelled));
    }
}
