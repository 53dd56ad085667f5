use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use scc::HashMap;
use serde::Serialize;
use thiserror::Error;

use crate::config::{GatewayConfig, HealthCheckConfig, HealthStatus, InstanceConfig};

/// Probe latencies kept per instance for selection scoring.
const RESPONSE_TIME_SAMPLES: usize = 10;
/// Response time assumed for instances that were never probed.
const DEFAULT_RESPONSE_TIME_MS: f64 = 1_000.0;

/// Errors related to registry operations
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("Instance '{instance}' is already registered for service '{service}'")]
    DuplicateInstance { service: String, instance: String },

    #[error("Invalid instance '{instance}': {reason}")]
    InvalidInstance { instance: String, reason: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Result of one liveness probe, as judged by the health checker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Healthy(Duration),
    /// Succeeded, but slower than the configured maximum response time
    Degraded(Duration),
    Unhealthy,
}

impl ProbeOutcome {
    /// Classify a probe from its success flag and latency.
    pub fn from_probe(success: bool, elapsed: Duration, max_response_time: Duration) -> Self {
        match (success, elapsed > max_response_time) {
            (false, _) => ProbeOutcome::Unhealthy,
            (true, true) => ProbeOutcome::Degraded(elapsed),
            (true, false) => ProbeOutcome::Healthy(elapsed),
        }
    }
}

/// Read-only snapshot of a registered instance.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInstance {
    pub service: String,
    pub name: String,
    pub url: String,
    pub weight: f64,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Mean of the recent probe latencies, if any were recorded
    pub avg_response_time_ms: Option<f64>,
    #[serde(skip)]
    pub last_check: Option<Instant>,
}

impl ServiceInstance {
    /// Selection score: faster, heavier and less failing instances score higher.
    pub fn score(&self) -> f64 {
        let response_time = self
            .avg_response_time_ms
            .unwrap_or(DEFAULT_RESPONSE_TIME_MS)
            .max(0.001);
        (1.0 / response_time) * self.weight * (1.0 / (self.consecutive_failures as f64 + 1.0))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub service: String,
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub instances: Vec<ServiceInstance>,
}

struct InstanceState {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    samples: VecDeque<f64>,
    last_check: Option<Instant>,
}

struct InstanceSlot {
    name: String,
    url: String,
    weight: f64,
    state: Mutex<InstanceState>,
}

impl InstanceSlot {
    fn snapshot(&self, service: &str) -> ServiceInstance {
        let state = self.state.lock();
        let avg_response_time_ms = if state.samples.is_empty() {
            None
        } else {
            Some(state.samples.iter().sum::<f64>() / state.samples.len() as f64)
        };
        ServiceInstance {
            service: service.to_string(),
            name: self.name.clone(),
            url: self.url.clone(),
            weight: self.weight,
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            avg_response_time_ms,
            last_check: state.last_check,
        }
    }
}

#[derive(Default)]
struct ServiceEntry {
    /// Registration order
    instances: RwLock<Vec<Arc<InstanceSlot>>>,
}

/// Known service instances and their health, with hysteresis on health changes.
///
/// The registry is the only writer of instance state; everything else reads
/// [`ServiceInstance`] snapshots.
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceEntry>>,
    health: HealthCheckConfig,
}

impl ServiceRegistry {
    pub fn new(health: HealthCheckConfig) -> Self {
        Self {
            services: HashMap::new(),
            health,
        }
    }

    /// Build a registry seeded with every instance in `config.services`.
    pub async fn from_config(config: &GatewayConfig) -> RegistryResult<Self> {
        let registry = Self::new(config.health_check.clone());
        for (service, service_config) in &config.services {
            for instance in &service_config.instances {
                registry.register(service, instance.clone()).await?;
            }
        }
        Ok(registry)
    }

    /// Add an instance. It starts in [`HealthStatus::Unknown`] until probed.
    pub async fn register(&self, service: &str, instance: InstanceConfig) -> RegistryResult<()> {
        if let Err(e) = url::Url::parse(&instance.url) {
            return Err(RegistryError::InvalidInstance {
                instance: instance.name,
                reason: format!("invalid url: {e}"),
            });
        }
        if instance.weight.is_nan() || instance.weight <= 0.0 {
            return Err(RegistryError::InvalidInstance {
                instance: instance.name,
                reason: format!("weight must be positive, got {}", instance.weight),
            });
        }

        let entry = self
            .services
            .entry_async(service.to_string())
            .await
            .or_insert_with(|| Arc::new(ServiceEntry::default()))
            .get()
            .clone();

        let mut instances = entry.instances.write();
        if instances.iter().any(|slot| slot.name == instance.name) {
            return Err(RegistryError::DuplicateInstance {
                service: service.to_string(),
                instance: instance.name,
            });
        }

        tracing::info!(
            service,
            instance = %instance.name,
            url = %instance.url,
            "Registered service instance"
        );
        instances.push(Arc::new(InstanceSlot {
            name: instance.name,
            url: instance.url,
            weight: instance.weight,
            state: Mutex::new(InstanceState {
                status: HealthStatus::Unknown,
                consecutive_failures: 0,
                consecutive_successes: 0,
                samples: VecDeque::with_capacity(RESPONSE_TIME_SAMPLES),
                last_check: None,
            }),
        }));
        Ok(())
    }

    /// Remove an instance; returns whether it was registered.
    pub async fn deregister(&self, service: &str, instance: &str) -> bool {
        let Some(entry) = self.entry(service).await else {
            return false;
        };
        let mut instances = entry.instances.write();
        let before = instances.len();
        instances.retain(|slot| slot.name != instance);
        let removed = instances.len() != before;
        if removed {
            tracing::info!(service, instance, "Deregistered service instance");
        }
        removed
    }

    /// Every registered instance of a service, in registration order.
    pub async fn instances(&self, service: &str) -> Vec<ServiceInstance> {
        match self.entry(service).await {
            Some(entry) => entry
                .instances
                .read()
                .iter()
                .map(|slot| slot.snapshot(service))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Instances currently healthy or degraded.
    pub async fn healthy_instances(&self, service: &str) -> Vec<ServiceInstance> {
        self.instances(service)
            .await
            .into_iter()
            .filter(|instance| instance.status.is_available())
            .collect()
    }

    /// The best instance to call.
    ///
    /// Scores available instances (ties go to the earliest registered). When none
    /// is available, falls back to the instance with the fewest consecutive
    /// failures, so `None` means the service has no instances at all.
    pub async fn best_instance(&self, service: &str) -> Option<ServiceInstance> {
        let instances = self.instances(service).await;

        let mut best: Option<(f64, &ServiceInstance)> = None;
        for instance in instances.iter().filter(|i| i.status.is_available()) {
            let score = instance.score();
            if best.is_none_or(|(top, _)| score > top) {
                best = Some((score, instance));
            }
        }
        if let Some((_, instance)) = best {
            return Some(instance.clone());
        }

        let mut fallback: Option<&ServiceInstance> = None;
        for instance in &instances {
            if fallback.is_none_or(|f| instance.consecutive_failures < f.consecutive_failures) {
                fallback = Some(instance);
            }
        }
        if let Some(instance) = fallback {
            tracing::debug!(
                service,
                instance = %instance.name,
                status = %instance.status,
                "No available instance, falling back to least failing"
            );
        }
        fallback.cloned()
    }

    /// Apply a probe result with hysteresis. Returns the resulting status, or
    /// `None` if the instance is not registered.
    pub async fn record_probe(
        &self,
        service: &str,
        instance: &str,
        outcome: ProbeOutcome,
    ) -> Option<HealthStatus> {
        let entry = self.entry(service).await?;
        let slot = entry
            .instances
            .read()
            .iter()
            .find(|slot| slot.name == instance)
            .cloned()?;

        let mut state = slot.state.lock();
        let previous = state.status;
        state.last_check = Some(Instant::now());

        match outcome {
            ProbeOutcome::Healthy(elapsed) => {
                push_sample(&mut state.samples, elapsed);
                state.consecutive_successes += 1;
                state.consecutive_failures = 0;
                state.status = match previous {
                    HealthStatus::Unhealthy
                        if state.consecutive_successes < self.health.healthy_threshold =>
                    {
                        HealthStatus::Unhealthy
                    }
                    _ => HealthStatus::Healthy,
                };
            }
            ProbeOutcome::Degraded(elapsed) => {
                // slow but answering: the failure counter is left alone
                push_sample(&mut state.samples, elapsed);
                state.consecutive_successes += 1;
                state.status = match previous {
                    HealthStatus::Unhealthy
                        if state.consecutive_successes < self.health.healthy_threshold =>
                    {
                        HealthStatus::Unhealthy
                    }
                    _ => HealthStatus::Degraded,
                };
            }
            ProbeOutcome::Unhealthy => {
                state.consecutive_failures += 1;
                state.consecutive_successes = 0;
                if state.consecutive_failures >= self.health.unhealthy_threshold {
                    state.status = HealthStatus::Unhealthy;
                }
            }
        }

        let current = state.status;
        if current != previous {
            match current {
                HealthStatus::Unhealthy => tracing::warn!(
                    service,
                    instance,
                    failures = state.consecutive_failures,
                    "Instance is now UNHEALTHY"
                ),
                _ => tracing::info!(
                    service,
                    instance,
                    from = %previous,
                    to = %current,
                    "Instance health changed"
                ),
            }
        }
        Some(current)
    }

    pub async fn stats(&self, service: &str) -> Option<ServiceStats> {
        self.entry(service).await?;
        let instances = self.instances(service).await;
        let count = |status: HealthStatus| instances.iter().filter(|i| i.status == status).count();
        Some(ServiceStats {
            service: service.to_string(),
            total: instances.len(),
            healthy: count(HealthStatus::Healthy),
            degraded: count(HealthStatus::Degraded),
            unhealthy: count(HealthStatus::Unhealthy),
            unknown: count(HealthStatus::Unknown),
            instances,
        })
    }

    /// Names of services with at least one registered instance, sorted.
    pub async fn services(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.services
            .retain_async(|name, entry| {
                if !entry.instances.read().is_empty() {
                    names.push(name.clone());
                }
                true
            })
            .await;
        names.sort();
        names
    }

    /// Snapshot of every instance of every service, for the health-check loop.
    pub async fn all_instances(&self) -> Vec<ServiceInstance> {
        let mut all = Vec::new();
        for service in self.services().await {
            all.extend(self.instances(&service).await);
        }
        all
    }

    async fn entry(&self, service: &str) -> Option<Arc<ServiceEntry>> {
        self.services
            .get_async(service)
            .await
            .map(|entry| entry.get().clone())
    }
}

fn push_sample(samples: &mut VecDeque<f64>, elapsed: Duration) {
    if samples.len() >= RESPONSE_TIME_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(elapsed.as_secs_f64() * 1000.0);
}
