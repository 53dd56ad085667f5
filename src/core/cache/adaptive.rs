//! Per-endpoint TTL derived from observed hit rate and upstream latency.
//!
//! The computed TTL is advisory: it is looked up when a response is written and
//! never changes entries that are already stored.
use std::time::Duration;

use scc::HashMap;
use serde::Serialize;

use crate::config::AdaptiveTtlConfig;

/// Hard ceiling for any adaptive TTL.
pub const MAX_ADAPTIVE_TTL: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Default)]
struct EndpointUsage {
    accesses: u64,
    hits: u64,
    total_latency_ms: f64,
    ttl: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointTtl {
    pub endpoint: String,
    pub accesses: u64,
    pub hit_rate: f64,
    pub avg_latency_ms: f64,
    pub ttl: Option<Duration>,
}

/// `default · (0.5 + hit_rate) · (1 + min(avg_latency_ms / 1000, 3))`, clamped
/// to `[min, min(max, 3600s)]`.
pub fn compute_ttl(
    default: Duration,
    hit_rate: f64,
    avg_latency_ms: f64,
    min: Duration,
    max: Duration,
) -> Duration {
    let latency_factor = 1.0 + (avg_latency_ms.max(0.0) / 1000.0).min(3.0);
    let hit_factor = 0.5 + hit_rate.clamp(0.0, 1.0);
    let secs = default.as_secs_f64() * hit_factor * latency_factor;

    let ceiling = max.min(MAX_ADAPTIVE_TTL);
    let floor = min.min(ceiling);
    Duration::from_secs_f64(secs).clamp(floor, ceiling)
}

pub struct AdaptiveTtl {
    config: AdaptiveTtlConfig,
    default_ttl: Duration,
    endpoints: HashMap<String, EndpointUsage>,
}

impl AdaptiveTtl {
    pub fn new(config: AdaptiveTtlConfig, default_ttl: Duration) -> Self {
        Self {
            config,
            default_ttl,
            endpoints: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record one lookup for `endpoint`; `latency_ms` is the cost of the lookup
    /// or of the downstream call that followed a miss.
    pub async fn record(&self, endpoint: &str, hit: bool, latency_ms: f64) {
        if !self.config.enabled {
            return;
        }
        let mut entry = self
            .endpoints
            .entry_async(endpoint.to_string())
            .await
            .or_insert_with(EndpointUsage::default);
        let usage = entry.get_mut();
        usage.accesses += 1;
        usage.total_latency_ms += latency_ms;
        if hit {
            usage.hits += 1;
        }
    }

    /// TTL to attach to a write for `endpoint`: the last computed value, or the
    /// default while the endpoint has too few samples.
    pub async fn ttl_for(&self, endpoint: &str) -> Duration {
        if !self.config.enabled {
            return self.default_ttl;
        }
        self.endpoints
            .get_async(endpoint)
            .await
            .and_then(|entry| entry.get().ttl)
            .unwrap_or(self.default_ttl)
    }

    /// Recompute TTLs for every endpoint with enough samples. Returns how many
    /// endpoints got a TTL.
    pub async fn recompute(&self) -> usize {
        let min = Duration::from_secs(self.config.min_ttl_secs);
        let max = Duration::from_secs(self.config.max_ttl_secs);
        let mut updated = 0;
        self.endpoints
            .retain_async(|endpoint, usage| {
                if usage.accesses >= self.config.min_samples {
                    let hit_rate = usage.hits as f64 / usage.accesses as f64;
                    let avg_latency = usage.total_latency_ms / usage.accesses as f64;
                    let ttl = compute_ttl(self.default_ttl, hit_rate, avg_latency, min, max);
                    if usage.ttl != Some(ttl) {
                        tracing::debug!(
                            endpoint = %endpoint,
                            hit_rate,
                            avg_latency_ms = avg_latency,
                            ttl_secs = ttl.as_secs(),
                            "Adaptive TTL updated"
                        );
                    }
                    usage.ttl = Some(ttl);
                    updated += 1;
                }
                true
            })
            .await;
        updated
    }

    pub async fn snapshot(&self) -> Vec<EndpointTtl> {
        let mut all = Vec::new();
        self.endpoints
            .retain_async(|endpoint, usage| {
                let accesses = usage.accesses.max(1) as f64;
                all.push(EndpointTtl {
                    endpoint: endpoint.clone(),
                    accesses: usage.accesses,
                    hit_rate: usage.hits as f64 / accesses,
                    avg_latency_ms: usage.total_latency_ms / accesses,
                    ttl: usage.ttl,
                });
                true
            })
            .await;
        all.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(30);
    const MAX: Duration = Duration::from_secs(3_600);

    #[test]
    fn test_compute_ttl_scales_with_hit_rate_and_latency() {
        let default = Duration::from_secs(300);
        assert_eq!(compute_ttl(default, 0.5, 0.0, MIN, MAX), Duration::from_secs(300));
        assert_eq!(compute_ttl(default, 1.0, 1_000.0, MIN, MAX), Duration::from_secs(900));
        let popular = compute_ttl(default, 0.9, 2_000.0, MIN, MAX);
        let unpopular = compute_ttl(default, 0.1, 2_000.0, MIN, MAX);
        assert!(popular > unpopular);
    }

    #[test]
    fn test_compute_ttl_is_bounded() {
        let default = Duration::from_secs(300);
        // latency factor caps at 4x
        assert_eq!(
            compute_ttl(default, 1.0, 60_000.0, MIN, MAX),
            Duration::from_secs(1_800)
        );
        let generous_max = Duration::from_secs(7_200);
        assert_eq!(
            compute_ttl(Duration::from_secs(1_000), 1.0, 60_000.0, MIN, generous_max),
            MAX_ADAPTIVE_TTL
        );
        assert_eq!(compute_ttl(Duration::from_secs(10), 0.0, 0.0, MIN, MAX), MIN);
    }

    #[tokio::test]
    async fn test_ttl_needs_min_samples() {
        let adaptive = AdaptiveTtl::new(AdaptiveTtlConfig::default(), Duration::from_secs(300));
        for _ in 0..9 {
            adaptive.record("gen:GET:/models", true, 2_000.0).await;
        }
        assert_eq!(adaptive.recompute().await, 0);
        assert_eq!(adaptive.ttl_for("gen:GET:/models").await, Duration::from_secs(300));

        adaptive.record("gen:GET:/models", true, 2_000.0).await;
        assert_eq!(adaptive.recompute().await, 1);
        // 300 · 1.5 · 3
        assert_eq!(adaptive.ttl_for("gen:GET:/models").await, Duration::from_secs(1_350));
        assert_eq!(adaptive.ttl_for("gen:GET:/other").await, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_disabled_adaptive_ttl_uses_default() {
        let config = AdaptiveTtlConfig {
            enabled: false,
            ..AdaptiveTtlConfig::default()
        };
        let adaptive = AdaptiveTtl::new(config, Duration::from_secs(120));
        for _ in 0..20 {
            adaptive.record("e", true, 3_000.0).await;
        }
        adaptive.recompute().await;
        assert_eq!(adaptive.ttl_for("e").await, Duration::from_secs(120));
        assert!(adaptive.snapshot().await.is_empty());
    }
}
