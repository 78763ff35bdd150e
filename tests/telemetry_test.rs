//! Integration tests for telemetry initialization and span helpers.

use juggler::model::JobId;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = juggler::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "juggler-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = juggler::telemetry::init_telemetry(config);
}

#[test]
fn telemetry_rejects_bad_log_level() {
    // Only consulted when RUST_LOG is unset.
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    let config = juggler::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "juggler-test".to_string(),
        log_level: "juggler=loudest".to_string(),
    };
    assert!(matches!(
        juggler::telemetry::init_telemetry(config),
        Err(juggler::Error::Config(_))
    ));
}

#[test]
fn job_span_creates_and_records_transition() {
    let span = juggler::telemetry::job::start_job_span("emails", JobId(42));
    juggler::telemetry::job::record_state_transition(&span, "new", "running");
    juggler::telemetry::job::record_state_transition(&span, "running", "succeeded");
}

#[test]
fn metric_instruments_build_without_a_provider() {
    use opentelemetry::KeyValue;

    juggler::telemetry::metrics::jobs_reserved().add(1, &[KeyValue::new("tube", "t")]);
    juggler::telemetry::metrics::job_outcomes().add(
        1,
        &[KeyValue::new("tube", "t"), KeyValue::new("outcome", "succeeded")],
    );
    juggler::telemetry::metrics::job_duration_ms().record(12.5, &[KeyValue::new("tube", "t")]);
}
