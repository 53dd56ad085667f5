//! `metrics`-crate backed implementation of the [`MetricsSink`] port.
//!
//! No exporter is embedded; the embedding application installs whatever
//! recorder it likes. Metric names are described once, lazily, the first time a
//! [`MetricsRecorder`] is created.
//!
//! Provided metrics (labels vary by family):
//! * `sluice_requests_total` (counter; service, outcome)
//! * `sluice_request_duration_seconds` (histogram; service, outcome)
//! * `sluice_circuit_state` (gauge; service; 0 closed, 1 half-open, 2 open)
//! * `sluice_circuit_transitions_total` (counter; service, to)
//! * `sluice_pool_in_use` (gauge; service)
//! * `sluice_pool_avg_response_ms` (gauge; service)
//! * `sluice_cache_requests_total` (counter; tier, result)
//! * `sluice_instance_health` (gauge; service, instance; 1 available, 0 otherwise)
use std::time::Duration;

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

use crate::{
    config::HealthStatus,
    core::circuit_breaker::CircuitState,
    ports::{CacheTier, MetricsSink, RequestOutcome},
};

pub const SLUICE_REQUESTS_TOTAL: &str = "sluice_requests_total";
pub const SLUICE_REQUEST_DURATION_SECONDS: &str = "sluice_request_duration_seconds";
pub const SLUICE_CIRCUIT_STATE: &str = "sluice_circuit_state";
pub const SLUICE_CIRCUIT_TRANSITIONS_TOTAL: &str = "sluice_circuit_transitions_total";
pub const SLUICE_POOL_IN_USE: &str = "sluice_pool_in_use";
pub const SLUICE_POOL_AVG_RESPONSE_MS: &str = "sluice_pool_avg_response_ms";
pub const SLUICE_CACHE_REQUESTS_TOTAL: &str = "sluice_cache_requests_total";
pub const SLUICE_INSTANCE_HEALTH: &str = "sluice_instance_health";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        SLUICE_REQUESTS_TOTAL,
        Unit::Count,
        "Dispatched calls by service and outcome."
    );
    describe_histogram!(
        SLUICE_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of dispatched calls, cache hits included."
    );
    describe_gauge!(
        SLUICE_CIRCUIT_STATE,
        "Circuit state per service (0 closed, 1 half-open, 2 open)."
    );
    describe_counter!(
        SLUICE_CIRCUIT_TRANSITIONS_TOTAL,
        Unit::Count,
        "Circuit state transitions by target state."
    );
    describe_gauge!(
        SLUICE_POOL_IN_USE,
        Unit::Count,
        "Leased connections per service pool."
    );
    describe_gauge!(
        SLUICE_POOL_AVG_RESPONSE_MS,
        Unit::Milliseconds,
        "Smoothed response time per service pool."
    );
    describe_counter!(
        SLUICE_CACHE_REQUESTS_TOTAL,
        Unit::Count,
        "Cache lookups by tier and result."
    );
    describe_gauge!(
        SLUICE_INSTANCE_HEALTH,
        "Instance availability (1 healthy or degraded, 0 otherwise)."
    );
});

/// Numeric encoding used for the circuit state gauge.
pub fn circuit_state_value(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    }
}

/// Numeric encoding used for the instance health gauge.
pub fn health_value(status: HealthStatus) -> f64 {
    if status.is_available() { 1.0 } else { 0.0 }
}

/// Forwards every measurement to the globally installed `metrics` recorder.
#[derive(Debug, Clone, Copy)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn new() -> Self {
        Lazy::force(&DESCRIPTIONS);
        Self
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for MetricsRecorder {
    fn request_outcome(&self, service: &str, outcome: RequestOutcome, elapsed: Duration) {
        counter!(
            SLUICE_REQUESTS_TOTAL,
            "service" => service.to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        histogram!(
            SLUICE_REQUEST_DURATION_SECONDS,
            "service" => service.to_string(),
            "outcome" => outcome.as_str()
        )
        .record(elapsed.as_secs_f64());
    }

    fn breaker_state(&self, service: &str, state: CircuitState) {
        gauge!(SLUICE_CIRCUIT_STATE, "service" => service.to_string())
            .set(circuit_state_value(state));
        counter!(
            SLUICE_CIRCUIT_TRANSITIONS_TOTAL,
            "service" => service.to_string(),
            "to" => state.as_str()
        )
        .increment(1);
    }

    fn pool_usage(&self, service: &str, in_use: usize, avg_response_time_ms: f64) {
        gauge!(SLUICE_POOL_IN_USE, "service" => service.to_string()).set(in_use as f64);
        gauge!(SLUICE_POOL_AVG_RESPONSE_MS, "service" => service.to_string())
            .set(avg_response_time_ms);
    }

    fn cache_access(&self, tier: CacheTier, hit: bool) {
        counter!(
            SLUICE_CACHE_REQUESTS_TOTAL,
            "tier" => tier.as_str(),
            "result" => if hit { "hit" } else { "miss" }
        )
        .increment(1);
    }

    fn instance_health(&self, service: &str, instance: &str, status: HealthStatus) {
        gauge!(
            SLUICE_INSTANCE_HEALTH,
            "service" => service.to_string(),
            "instance" => instance.to_string()
        )
        .set(health_value(status));
    }
}
