//! Metrics collection and exposition.
//!
//! # Metrics
//! - `guard_admissions_total` (counter): checks by action and outcome
//! - `guard_violations_total` (counter): denied checks recorded against a score
//! - `guard_store_fallbacks_total` (counter): operations served from local state
//! - `guard_store_degraded` (gauge): 1 while the shared store is unreachable
//! - `guard_security_events_total` (counter): security events by severity
//! - `guard_event_sink_failures_total` (counter): failed sink writes
//!
//! # Design Decisions
//! - Recording is a no-op until `init_metrics` installs the exporter
//! - Unconfigured actions share the `unknown` label to bound cardinality

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

const COUNTER_ADMISSIONS: &str = "guard_admissions_total";
const COUNTER_VIOLATIONS: &str = "guard_violations_total";
const COUNTER_STORE_FALLBACKS: &str = "guard_store_fallbacks_total";
const GAUGE_STORE_DEGRADED: &str = "guard_store_degraded";
const COUNTER_SECURITY_EVENTS: &str = "guard_security_events_total";
const COUNTER_SINK_FAILURES: &str = "guard_event_sink_failures_total";

/// Install the Prometheus recorder and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(error) => tracing::error!(address = %addr, error = %error, "Failed to install metrics exporter"),
    }
}

/// Outcome of one admission check: `allowed`, `denied`, `blocked` or `unlimited`.
pub fn record_admission(action: &str, outcome: &'static str) {
    metrics::counter!(
        COUNTER_ADMISSIONS,
        "action" => action.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_violation(action: &str) {
    metrics::counter!(COUNTER_VIOLATIONS, "action" => action.to_string()).increment(1);
}

pub fn record_store_fallback(op: &'static str) {
    metrics::counter!(COUNTER_STORE_FALLBACKS, "op" => op).increment(1);
}

pub fn set_store_degraded(degraded: bool) {
    metrics::gauge!(GAUGE_STORE_DEGRADED).set(if degraded { 1.0 } else { 0.0 });
}

pub fn record_security_event(severity: &'static str) {
    metrics::counter!(COUNTER_SECURITY_EVENTS, "severity" => severity).increment(1);
}

pub fn record_sink_failure(sink: &'static str) {
    metrics::counter!(COUNTER_SINK_FAILURES, "sink" => sink).increment(1);
}
