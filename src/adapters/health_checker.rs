use std::{sync::Arc, time::Instant};

use futures_util::future::join_all;

use crate::{
    config::{GatewayConfig, HealthStatus},
    core::registry::{ProbeOutcome, ServiceInstance, ServiceRegistry},
    ports::{HealthProbe, MetricsSink},
    utils::background::BackgroundLoop,
};

/// Result of probing one instance during a check cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub service: String,
    pub instance: String,
    pub url: String,
    pub outcome: ProbeOutcome,
    /// Status after hysteresis was applied; `None` if the instance was
    /// deregistered while the probe was in flight
    pub status: Option<HealthStatus>,
}

/// Periodically probes every registered instance and feeds the results into
/// the registry, which owns the hysteresis rules.
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    probe: Arc<dyn HealthProbe>,
    config: Arc<GatewayConfig>,
    metrics: Arc<dyn MetricsSink>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        probe: Arc<dyn HealthProbe>,
        config: Arc<GatewayConfig>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            probe,
            config,
            metrics,
        }
    }

    /// Liveness URL for an instance: its base URL plus the service's health
    /// path, or the global one.
    pub fn health_url(&self, instance: &ServiceInstance) -> String {
        let path = self
            .config
            .services
            .get(&instance.service)
            .and_then(|service| service.health_path.as_deref())
            .unwrap_or(&self.config.health_check.path);
        let base = instance.url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    /// Probe every registered instance once, concurrently.
    pub async fn check_once(&self) -> Vec<ProbeReport> {
        let instances = self.registry.all_instances().await;
        if instances.is_empty() {
            return Vec::new();
        }

        let checks = instances.into_iter().map(|instance| self.check_instance(instance));
        let reports = join_all(checks).await;

        let unhealthy = reports
            .iter()
            .filter(|r| r.status == Some(HealthStatus::Unhealthy))
            .count();
        tracing::debug!(
            probed = reports.len(),
            unhealthy,
            "Health check cycle completed"
        );
        reports
    }

    async fn check_instance(&self, instance: ServiceInstance) -> ProbeReport {
        let health = &self.config.health_check;
        let url = self.health_url(&instance);
        let timeout = health.timeout();

        let started = Instant::now();
        let success = match tokio::time::timeout(timeout, self.probe.probe(&url, timeout)).await {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(e)) => {
                tracing::debug!(url = %url, error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(url = %url, ?timeout, "Health probe timed out");
                false
            }
        };
        let outcome =
            ProbeOutcome::from_probe(success, started.elapsed(), health.max_response_time());

        let status = self
            .registry
            .record_probe(&instance.service, &instance.name, outcome)
            .await;
        if let Some(status) = status {
            self.metrics
                .instance_health(&instance.service, &instance.name, status);
        }

        ProbeReport {
            service: instance.service,
            instance: instance.name,
            url,
            outcome,
            status,
        }
    }

    /// Start the periodic check loop, or `None` when health checking is disabled.
    pub fn spawn(self: Arc<Self>) -> Option<BackgroundLoop> {
        let health = &self.config.health_check;
        if !health.enabled {
            tracing::info!("Health checking is disabled");
            return None;
        }

        let interval = health.interval();
        tracing::info!(
            interval_secs = health.interval_secs,
            timeout_secs = health.timeout_secs,
            path = %health.path,
            "Starting health checker"
        );

        Some(BackgroundLoop::spawn("health-check", interval, move || {
            let checker = Arc::clone(&self);
            async move {
                checker.check_once().await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        config::HealthCheckConfig,
        ports::{NoopMetrics, TransportError, TransportResult},
    };

    /// Answers from a fixed table of URL -> result and records what it saw.
    #[derive(Default)]
    struct ScriptedProbe {
        unhealthy: Vec<String>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, url: &str, _timeout: Duration) -> TransportResult<bool> {
            self.seen.lock().push(url.to_string());
            if self.unhealthy.iter().any(|u| u == url) {
                Err(TransportError::Connection("refused".to_string()))
            } else {
                Ok(true)
            }
        }
    }

    fn config() -> Arc<GatewayConfig> {
        let mut config = GatewayConfig::builder()
            .service("gen", "gen-1", "http://gen-1:8000/")
            .service("gen", "gen-2", "http://gen-2:8000")
            .service("img", "img-1", "http://img-1:9000")
            .health_check(HealthCheckConfig {
                unhealthy_threshold: 2,
                ..HealthCheckConfig::default()
            })
            .build();
        if let Some(img) = config.services.get_mut("img") {
            img.health_path = Some("/status".to_string());
        }
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_health_urls_use_service_path() {
        let config = config();
        let registry = Arc::new(ServiceRegistry::from_config(&config).await.unwrap());
        let probe = Arc::new(ScriptedProbe::default());
        let checker = HealthChecker::new(registry, probe.clone(), config, Arc::new(NoopMetrics));

        checker.check_once().await;

        let mut seen = probe.seen.lock().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                "http://gen-1:8000/health",
                "http://gen-2:8000/health",
                "http://img-1:9000/status",
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_instance_goes_unhealthy_after_threshold() {
        let config = config();
        let registry = Arc::new(ServiceRegistry::from_config(&config).await.unwrap());
        let probe = Arc::new(ScriptedProbe {
            unhealthy: vec!["http://gen-2:8000/health".to_string()],
            ..ScriptedProbe::default()
        });
        let checker = HealthChecker::new(registry.clone(), probe, config, Arc::new(NoopMetrics));

        let first = checker.check_once().await;
        let gen2 = first.iter().find(|r| r.instance == "gen-2").unwrap();
        assert_eq!(gen2.outcome, ProbeOutcome::Unhealthy);
        assert_eq!(gen2.status, Some(HealthStatus::Unknown));

        checker.check_once().await;
        let healthy: Vec<String> = registry
            .healthy_instances("gen")
            .await
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(healthy, vec!["gen-1"]);
        assert_eq!(registry.stats("gen").await.unwrap().unhealthy, 1);
    }

    #[tokio::test]
    async fn test_disabled_checker_does_not_spawn() {
        let mut config = (*config()).clone();
        config.health_check.enabled = false;
        let config = Arc::new(config);
        let registry = Arc::new(ServiceRegistry::from_config(&config).await.unwrap());
        let checker = Arc::new(HealthChecker::new(
            registry,
            Arc::new(ScriptedProbe::default()),
            config,
            Arc::new(NoopMetrics),
        ));
        assert!(checker.spawn().is_none());
    }
}
