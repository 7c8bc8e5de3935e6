/// Centralized error handling for the Sambaza bridge
///
/// Every error in the system falls into exactly one class of the taxonomy
/// below, and each class carries a fixed routing decision: surface to the
/// caller, recover locally, retry with backoff, or fail the transaction.
/// User-visible failures carry a stable code and a short human message;
/// provider stack traces never leak through.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use sambaza_types::{TransactionId, TxState};
use serde::{Deserialize, Serialize};

/// Standard API error response body shared by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<TransactionId>,
}

/// The bridge error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Bad input, limit violation, unsupported flow combination.
    /// Surfaced immediately; no state change.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// A create retried with an idempotency key that already owns a
    /// transaction. Carries the existing id so the caller can converge.
    #[error("duplicate idempotency key, existing transaction {existing}")]
    DuplicateIdempotencyKey { existing: TransactionId },

    /// payment_hash collision on create
    #[error("duplicate payment hash")]
    DuplicatePaymentHash,

    /// Optimistic concurrency lost on a transition; retried once locally,
    /// then surfaced as Upstream.
    #[error("stale version for transaction {id}")]
    StaleVersion { id: TransactionId },

    #[error("transaction not found")]
    NotFound,

    /// Rate feed unavailable or stale
    #[error("no current BTC/KES rate available")]
    RateUnavailable,

    /// Transient upstream failure: rate feed down, Daraja 5xx, Lightning
    /// RPC timeout. Retried with backoff; exhaustion fails the transaction.
    #[error("{service} unavailable: {message}")]
    UpstreamTransient { service: &'static str, message: String },

    /// Terminal upstream failure: Daraja 4xx / terminal result code,
    /// invalid MSISDN per Daraja, insufficient float. No retry.
    #[error("{service} rejected the request: {message}")]
    UpstreamPermanent { service: &'static str, message: String },

    /// The risk engine vetoed the payout. Routed like UpstreamPermanent.
    #[error("transaction blocked by risk policy")]
    RiskBlocked,

    /// An illegal state transition or a broken consistency rule. The only
    /// class that is fatal to its request; logged critical, the process
    /// keeps serving other transactions.
    #[error("invariant violation on {id}: {from} -> {to} is not a legal transition")]
    IllegalTransition { id: TransactionId, from: TxState, to: TxState },

    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },

    /// Webhook authentication failure
    #[error("webhook rejected: {message}")]
    WebhookRejected { message: String },

    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            BridgeError::DuplicateIdempotencyKey { .. } => StatusCode::CONFLICT,
            BridgeError::DuplicatePaymentHash => StatusCode::CONFLICT,
            BridgeError::StaleVersion { .. } => StatusCode::CONFLICT,
            BridgeError::NotFound => StatusCode::NOT_FOUND,
            BridgeError::RateUnavailable => StatusCode::UNPROCESSABLE_ENTITY,
            BridgeError::UpstreamTransient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::UpstreamPermanent { .. } => StatusCode::BAD_GATEWAY,
            BridgeError::RiskBlocked => StatusCode::UNPROCESSABLE_ENTITY,
            BridgeError::IllegalTransition { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::InvariantViolation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::WebhookRejected { .. } => StatusCode::UNAUTHORIZED,
            BridgeError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::InvalidInput { .. } => "INVALID_INPUT",
            BridgeError::DuplicateIdempotencyKey { .. } => "DUPLICATE_IDEMPOTENCY_KEY",
            BridgeError::DuplicatePaymentHash => "DUPLICATE_PAYMENT_HASH",
            BridgeError::StaleVersion { .. } => "STALE_VERSION",
            BridgeError::NotFound => "NOT_FOUND",
            BridgeError::RateUnavailable => "RATE_UNAVAILABLE",
            BridgeError::UpstreamTransient { .. } => "UPSTREAM_UNAVAILABLE",
            BridgeError::UpstreamPermanent { .. } => "UPSTREAM_REJECTED",
            BridgeError::RiskBlocked => "RISK_BLOCKED",
            BridgeError::IllegalTransition { .. } => "INVARIANT_VIOLATION",
            BridgeError::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            BridgeError::WebhookRejected { .. } => "WEBHOOK_REJECTED",
            BridgeError::Database(_) => "DATABASE_ERROR",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show to end users
    pub fn user_message(&self) -> String {
        match self {
            BridgeError::InvalidInput { message } => message.clone(),
            BridgeError::DuplicateIdempotencyKey { .. } => {
                "This request was already accepted.".to_string()
            }
            BridgeError::DuplicatePaymentHash => {
                "A transaction with this payment hash already exists.".to_string()
            }
            BridgeError::StaleVersion { .. } => {
                "The transaction was updated concurrently. Please retry.".to_string()
            }
            BridgeError::NotFound => "Transaction not found.".to_string(),
            BridgeError::RateUnavailable => {
                "Exchange rate temporarily unavailable. Please try again.".to_string()
            }
            BridgeError::UpstreamTransient { service, .. } => {
                format!("{service} temporarily unavailable. Please try again.")
            }
            BridgeError::UpstreamPermanent { service, .. } => {
                format!("{service} could not process this request.")
            }
            BridgeError::RiskBlocked => "This transaction cannot be processed.".to_string(),
            BridgeError::IllegalTransition { .. } | BridgeError::InvariantViolation { .. } => {
                "Internal error. Please contact support.".to_string()
            }
            BridgeError::WebhookRejected { .. } => "Unauthorized.".to_string(),
            BridgeError::Database(_) => {
                "Service temporarily unavailable. Please try again.".to_string()
            }
            BridgeError::Internal(_) => "Internal error. Please contact support.".to_string(),
        }
    }

    /// True when the retry policy should keep trying the side effect.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::UpstreamTransient { .. }
                | BridgeError::RateUnavailable
                | BridgeError::Database(_)
        )
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();

        // Invariant violations are the one class that must never pass
        // silently; everything else logs at error.
        match &self {
            BridgeError::IllegalTransition { .. } | BridgeError::InvariantViolation { .. } => {
                tracing::error!(error = ?self, "CRITICAL invariant violation");
            }
            _ => tracing::error!(error = ?self, "API error"),
        }

        let tx_id = match &self {
            BridgeError::DuplicateIdempotencyKey { existing } => Some(*existing),
            _ => None,
        };

        let body = ErrorResponse {
            error: self.error_code().to_string(),
            message: self.user_message(),
            tx_id,
        };

        (status_code, Json(body)).into_response()
    }
}

/// Convenient result type for all bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Shorthand constructors for the common cases
impl BridgeError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        BridgeError::InvalidInput { message: message.into() }
    }

    pub fn daraja_transient(message: impl Into<String>) -> Self {
        BridgeError::UpstreamTransient { service: "M-Pesa", message: message.into() }
    }

    pub fn daraja_permanent(message: impl Into<String>) -> Self {
        BridgeError::UpstreamPermanent { service: "M-Pesa", message: message.into() }
    }

    pub fn lightning_transient(message: impl Into<String>) -> Self {
        BridgeError::UpstreamTransient { service: "Lightning", message: message.into() }
    }

    pub fn lightning_permanent(message: impl Into<String>) -> Self {
        BridgeError::UpstreamPermanent { service: "Lightning", message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            BridgeError::invalid_input("bad amount").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(BridgeError::RateUnavailable.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            BridgeError::DuplicateIdempotencyKey { existing: TransactionId::new() }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            BridgeError::daraja_transient("502").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_transience_routing() {
        assert!(BridgeError::daraja_transient("timeout").is_transient());
        assert!(BridgeError::RateUnavailable.is_transient());
        assert!(!BridgeError::daraja_permanent("invalid msisdn").is_transient());
        assert!(!BridgeError::RiskBlocked.is_transient());
    }

    #[test]
    fn test_user_messages_hide_internals() {
        let err = BridgeError::Internal(anyhow::anyhow!("connection pool exhausted at foo.rs:42"));
        assert!(!err.user_message().contains("foo.rs"));

        let err = BridgeError::daraja_permanent("ResultCode 2001: initiator info invalid");
        assert!(!err.user_message().contains("2001"));
    }
}
