use std::time::Duration;

use crate::{config::HealthStatus, core::circuit_breaker::CircuitState};

/// Outcome label attached to every dispatched call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    CacheHit,
    Success,
    DownstreamFailure,
    CircuitOpen,
    NoInstance,
    PoolExhausted,
    Rejected,
}

impl RequestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestOutcome::CacheHit => "cache_hit",
            RequestOutcome::Success => "success",
            RequestOutcome::DownstreamFailure => "downstream_failure",
            RequestOutcome::CircuitOpen => "circuit_open",
            RequestOutcome::NoInstance => "no_instance",
            RequestOutcome::PoolExhausted => "pool_exhausted",
            RequestOutcome::Rejected => "rejected",
        }
    }
}

/// Which cache tier answered (or missed) a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Local,
    Remote,
}

impl CacheTier {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheTier::Local => "local",
            CacheTier::Remote => "remote",
        }
    }
}

/// Metrics port. The core only writes through it and never reads values back.
pub trait MetricsSink: Send + Sync + 'static {
    fn request_outcome(&self, service: &str, outcome: RequestOutcome, elapsed: Duration);

    fn breaker_state(&self, service: &str, state: CircuitState);

    fn pool_usage(&self, service: &str, in_use: usize, avg_response_time_ms: f64);

    fn cache_access(&self, tier: CacheTier, hit: bool);

    fn instance_health(&self, service: &str, instance: &str, status: HealthStatus);
}

/// Sink that drops every measurement.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn request_outcome(&self, _service: &str, _outcome: RequestOutcome, _elapsed: Duration) {}

    fn breaker_state(&self, _service: &str, _state: CircuitState) {}

    fn pool_usage(&self, _service: &str, _in_use: usize, _avg_response_time_ms: f64) {}

    fn cache_access(&self, _tier: CacheTier, _hit: bool) {}

    fn instance_health(&self, _service: &str, _instance: &str, _status: HealthStatus) {}
}
