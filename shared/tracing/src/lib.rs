/// Structured logging and tracing for the Sambaza bridge
///
/// JSON structured logs in production, pretty console logs in development,
/// and request correlation via a per-request trace id. Transitions of the
/// transaction state machine are logged through `log_transition` so the
/// audit trail in the logs mirrors the event ledger.

use tracing::{info, Span};
use tracing_subscriber::{
    fmt::{format::FmtSpan, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};
use uuid::Uuid;

/// Initialize logging for the bridge process. Call once at startup.
pub fn init_tracing(service_name: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(UtcTime::rfc_3339());

    if is_production() {
        // JSON structured logging for log aggregation
        let json_layer = fmt_layer.json().with_current_span(true).with_span_list(true);

        tracing_subscriber::registry().with(env_filter).with(json_layer).init();
    } else {
        let console_layer = fmt_layer.pretty();

        tracing_subscriber::registry().with(env_filter).with(console_layer).init();
    }

    info!(service = service_name, "Tracing initialized");
}

fn is_production() -> bool {
    std::env::var("ENVIRONMENT")
        .unwrap_or_else(|_| "development".to_string())
        .to_lowercase()
        == "production"
}

/// Generate a unique trace ID for request correlation
pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Add structured fields to the current span
pub fn add_span_fields(fields: &[(&str, &str)]) {
    let current_span = Span::current();
    for (key, value) in fields {
        current_span.record(*key, *value);
    }
}

/// Log a state transition of the transaction machine
///
/// Every committed transition goes through here; together with the event
/// ledger this is the system's audit trail.
pub fn log_transition(
    tx_id: &str,
    payment_hash: &str,
    flow: &str,
    from_state: &str,
    to_state: &str,
    kes_cents: i64,
) {
    info!(
        tx_id = tx_id,
        payment_hash = payment_hash,
        flow = flow,
        from_state = from_state,
        to_state = to_state,
        kes_cents = kes_cents,
        "Transaction transition"
    );
}

/// Log an external API call for debugging integration issues
pub fn log_external_api_call(
    service: &str,
    endpoint: &str,
    status_code: Option<u16>,
    duration_ms: u64,
    error: Option<&str>,
) {
    if let Some(error) = error {
        tracing::error!(
            service = service,
            endpoint = endpoint,
            duration_ms = duration_ms,
            error = error,
            "External API call failed"
        );
    } else {
        info!(
            service = service,
            endpoint = endpoint,
            status_code = status_code,
            duration_ms = duration_ms,
            "External API call completed"
        );
    }
}

/// Middleware layer that stamps every request with a trace id span
pub fn trace_id_layer() -> tower_http::trace::TraceLayer<
    tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>,
    impl Fn(&http::Request<axum::body::Body>) -> tracing::Span + Clone,
> {
    tower_http::trace::TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
        let trace_id = generate_trace_id();

        tracing::info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            trace_id = %trace_id,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_generation() {
        let trace_id1 = generate_trace_id();
        let trace_id2 = generate_trace_id();

        assert_ne!(trace_id1, trace_id2);
        assert_eq!(trace_id1.len(), 36);
    }
}
