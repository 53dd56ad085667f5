//! Configuration data structures for Sluice.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and include defaults so that minimal configs remain concise.
//! The whole tree is loaded once at startup, validated, and then shared read‑only
//! behind an `Arc`.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration for the traffic-resilience layer.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Downstream services keyed by service name
    pub services: HashMap<String, ServiceConfig>,
    pub health_check: HealthCheckConfig,
    /// Breaker settings applied to every service without an override
    pub circuit_breaker: CircuitBreakerConfig,
    pub circuit_breaker_overrides: HashMap<String, CircuitBreakerConfig>,
    /// Pool limits applied to every service without an override
    pub pool: PoolConfig,
    pub pool_overrides: HashMap<String, PoolConfig>,
    pub pool_maintenance: PoolMaintenanceConfig,
    pub cache: CacheConfig,
    pub dispatcher: DispatcherConfig,
}

impl GatewayConfig {
    /// Create a new configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Breaker settings for a service (override or global default).
    pub fn breaker_for(&self, service: &str) -> &CircuitBreakerConfig {
        self.circuit_breaker_overrides
            .get(service)
            .unwrap_or(&self.circuit_breaker)
    }

    /// Pool limits for a service (override or global default).
    pub fn pool_for(&self, service: &str) -> &PoolConfig {
        self.pool_overrides.get(service).unwrap_or(&self.pool)
    }
}

/// Builder for GatewayConfig, mostly used when embedding or in tests.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Add a service with a single instance
    pub fn service(
        mut self,
        name: impl Into<String>,
        instance: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        self.config
            .services
            .entry(name.into())
            .or_default()
            .instances
            .push(InstanceConfig {
                name: instance.into(),
                url: url.into(),
                weight: default_weight(),
            });
        self
    }

    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.config.health_check = config;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.config.pool = config;
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    /// Append a cache rule evaluated by the dispatcher
    pub fn cache_rule(mut self, rule: CacheRule) -> Self {
        self.config.dispatcher.cache_rules.push(rule);
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

fn default_weight() -> f64 {
    1.0
}

/// A downstream service and its statically known instances.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub instances: Vec<InstanceConfig>,
    /// Liveness path for this service (falls back to `health_check.path`)
    pub health_path: Option<String>,
}

/// One addressable instance of a service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub path: String,
    /// Consecutive failing probes before an instance is marked unhealthy
    pub unhealthy_threshold: u32,
    /// Consecutive healthy probes before an unhealthy instance recovers
    pub healthy_threshold: u32,
    /// Probes slower than this report the instance as degraded
    pub max_response_time_ms: u64,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_response_time(&self) -> Duration {
        Duration::from_millis(self.max_response_time_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 5,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            max_response_time_ms: 5_000,
        }
    }
}

/// Weight contributed by each failure category to the breaker's windowed score.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct FailureWeights {
    pub timeout: f64,
    pub connection: f64,
    pub http_5xx: f64,
    pub http_4xx: f64,
    pub slow_response: f64,
}

impl Default for FailureWeights {
    fn default() -> Self {
        Self {
            timeout: 2.0,
            connection: 2.0,
            http_5xx: 1.5,
            http_4xx: 0.5,
            slow_response: 1.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Weighted failure score that opens the circuit at the baseline failure rate
    pub failure_threshold: f64,
    /// Lower bound for the adaptive threshold
    pub min_failure_threshold: f64,
    /// Trailing window for failure records and response-time samples
    pub window_secs: u64,
    /// Outcomes required before rate-based checks engage
    pub minimum_requests: usize,
    pub recovery_timeout_secs: u64,
    pub recovery_multiplier: f64,
    pub max_recovery_timeout_secs: u64,
    /// Probe calls admitted (and successes required) while half-open
    pub half_open_max_calls: u32,
    pub slow_response_threshold_ms: u64,
    pub weights: FailureWeights,
}

impl CircuitBreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn slow_response_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_response_threshold_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10.0,
            min_failure_threshold: 3.0,
            window_secs: 60,
            minimum_requests: 10,
            recovery_timeout_secs: 30,
            recovery_multiplier: 2.0,
            max_recovery_timeout_secs: 300,
            half_open_max_calls: 3,
            slow_response_threshold_ms: 5_000,
            weights: FailureWeights::default(),
        }
    }
}

/// Connection limits for one service's pooled client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub max_idle_connections: usize,
    pub max_connections: usize,
    pub keep_alive_secs: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl PoolConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_connections: 20,
            max_connections: 100,
            keep_alive_secs: 30,
            request_timeout_secs: 30,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PoolMaintenanceConfig {
    pub interval_secs: u64,
    /// Pools idle for longer than this get their idle connections dropped
    pub idle_shrink_secs: u64,
    pub min_success_rate: f64,
    pub min_requests_for_flagging: u64,
    pub slow_pool_threshold_ms: f64,
    pub sweep_interval_secs: u64,
    /// Pools untouched for longer than this are deleted with their statistics
    pub stale_after_secs: u64,
}

impl Default for PoolMaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            idle_shrink_secs: 300,
            min_success_rate: 0.5,
            min_requests_for_flagging: 10,
            slow_pool_threshold_ms: 10_000.0,
            sweep_interval_secs: 600,
            stale_after_secs: 3_600,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Item ceiling of the in-process tier
    pub local_max_items: usize,
    pub default_ttl_secs: u64,
    /// TTL given to fast-tier copies backfilled from the remote tier
    pub backfill_ttl_secs: u64,
    /// Serialized payloads larger than this are zlib-compressed
    pub compression_threshold_bytes: usize,
    pub remote_timeout_ms: u64,
    pub sweep_interval_secs: u64,
    pub adaptive_ttl: AdaptiveTtlConfig,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn backfill_ttl(&self) -> Duration {
        Duration::from_secs(self.backfill_ttl_secs.min(self.default_ttl_secs))
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_max_items: 1_000,
            default_ttl_secs: 300,
            backfill_ttl_secs: 60,
            compression_threshold_bytes: 1_024,
            remote_timeout_ms: 250,
            sweep_interval_secs: 60,
            adaptive_ttl: AdaptiveTtlConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AdaptiveTtlConfig {
    pub enabled: bool,
    pub recompute_interval_secs: u64,
    pub min_ttl_secs: u64,
    pub max_ttl_secs: u64,
    /// Accesses required before an endpoint gets its own TTL
    pub min_samples: u64,
}

impl Default for AdaptiveTtlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recompute_interval_secs: 300,
            min_ttl_secs: 30,
            max_ttl_secs: 3_600,
            min_samples: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Request headers folded into the cache key (case-insensitive)
    pub cache_key_headers: Vec<String>,
    /// Evaluated in order, first match wins
    pub cache_rules: Vec<CacheRule>,
}

/// Decides whether a method/path/auth-state combination may be cached.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheRule {
    #[serde(default = "default_cache_methods")]
    pub methods: Vec<String>,
    /// Glob over the normalized request path (`*` within a segment, `**` across)
    pub path: String,
    /// Human readable TTL ("90s", "5m"); adaptive/default TTL when absent
    #[serde(default)]
    pub ttl: Option<String>,
    /// Whether requests carrying an Authorization header may be cached
    #[serde(default)]
    pub cache_authenticated: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_cache_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

impl CacheRule {
    /// A rule matching GET/HEAD under the given path glob
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            methods: default_cache_methods(),
            path: path.into(),
            ttl: None,
            cache_authenticated: false,
            tags: Vec::new(),
        }
    }

    /// Parsed TTL, `None` when absent or unparsable (validation rejects the latter)
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
            .as_deref()
            .and_then(|raw| humantime::parse_duration(raw).ok())
    }
}

/// Health of a registered instance as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Instances in these states take part in score-based selection
    pub fn is_available(self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_fall_back_to_defaults() {
        let mut config = GatewayConfig::default();
        config.pool_overrides.insert(
            "gen".to_string(),
            PoolConfig {
                max_connections: 4,
                ..PoolConfig::default()
            },
        );

        assert_eq!(config.pool_for("gen").max_connections, 4);
        assert_eq!(config.pool_for("other").max_connections, 100);
        assert_eq!(config.breaker_for("gen").failure_threshold, 10.0);
    }

    #[test]
    fn test_cache_rule_ttl_parsing() {
        let mut rule = CacheRule::get("/models/*");
        assert_eq!(rule.ttl(), None);

        rule.ttl = Some("5m".to_string());
        assert_eq!(rule.ttl(), Some(Duration::from_secs(300)));

        rule.ttl = Some("soon".to_string());
        assert_eq!(rule.ttl(), None);
    }

    #[test]
    fn test_builder_groups_instances_by_service() {
        let config = GatewayConfig::builder()
            .service("gen", "gen-1", "http://gen-1:8000")
            .service("gen", "gen-2", "http://gen-2:8000")
            .build();

        let gen_service = &config.services["gen"];
        assert_eq!(gen_service.instances.len(), 2);
        assert_eq!(gen_service.instances[1].weight, 1.0);
    }

    #[test]
    fn test_backfill_ttl_never_exceeds_default() {
        let config = CacheConfig {
            default_ttl_secs: 20,
            backfill_ttl_secs: 60,
            ..CacheConfig::default()
        };
        assert_eq!(config.backfill_ttl(), Duration::from_secs(20));
    }
}
