//! Composition root for the traffic-resilience layer.
//!
//! `TrafficCore` takes an immutable, validated [`GatewayConfig`] plus the
//! injected collaborators ([`TrafficPorts`]) and wires the registry, breakers,
//! pools, cache and dispatcher together. It owns the lifecycle of every
//! background loop:
//! * health checks
//! * pool maintenance and the stale-pool sweep
//! * the fast-tier expiry sweep and adaptive TTL recomputation
use std::sync::Arc;

use eyre::{Result, WrapErr};
use parking_lot::Mutex;

use crate::{
    adapters::{HealthChecker, HttpHealthProbe, ReqwestClientFactory},
    config::{GatewayConfig, GatewayConfigValidator},
    core::{
        cache::CacheLayer,
        circuit_breaker::CircuitBreakers,
        dispatcher::Dispatcher,
        error::DispatchError,
        pool::ConnectionPoolManager,
        registry::ServiceRegistry,
    },
    ports::{
        ClientFactory, DownstreamRequest, DownstreamResponse, HealthProbe, MetricsSink,
        NoopMetrics, RemoteCache,
    },
    utils::background::BackgroundLoop,
};

/// Collaborators injected into the core.
#[derive(Clone)]
pub struct TrafficPorts {
    pub client_factory: Arc<dyn ClientFactory>,
    pub health_probe: Arc<dyn HealthProbe>,
    /// Shared second cache tier; the cache runs local-only without one
    pub remote_cache: Option<Arc<dyn RemoteCache>>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl TrafficPorts {
    /// reqwest-backed clients and probes, no remote cache, no metrics.
    pub fn http() -> Result<Self> {
        Ok(Self {
            client_factory: Arc::new(ReqwestClientFactory),
            health_probe: Arc::new(HttpHealthProbe::new()?),
            remote_cache: None,
            metrics: Arc::new(NoopMetrics),
        })
    }

    /// Ports built from caller-supplied client and probe implementations.
    pub fn new(client_factory: Arc<dyn ClientFactory>, health_probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            client_factory,
            health_probe,
            remote_cache: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_remote_cache(mut self, remote: Arc<dyn RemoteCache>) -> Self {
        self.remote_cache = Some(remote);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }
}

pub struct TrafficCore {
    config: Arc<GatewayConfig>,
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakers>,
    pools: Arc<ConnectionPoolManager>,
    cache: Arc<CacheLayer>,
    dispatcher: Arc<Dispatcher>,
    health_checker: Arc<HealthChecker>,
    loops: Mutex<Vec<BackgroundLoop>>,
}

impl TrafficCore {
    /// Validate `config` and build every component. Nothing runs in the
    /// background until [`TrafficCore::start`] is called.
    pub async fn new(config: GatewayConfig, ports: TrafficPorts) -> Result<Self> {
        GatewayConfigValidator::validate(&config).wrap_err("Invalid gateway configuration")?;
        let config = Arc::new(config);

        let registry = Arc::new(
            ServiceRegistry::from_config(&config)
                .await
                .wrap_err("Failed to seed service registry")?,
        );
        let breakers = Arc::new(CircuitBreakers::new(config.clone(), ports.metrics.clone()));
        let pools = Arc::new(ConnectionPoolManager::new(
            config.clone(),
            ports.client_factory.clone(),
            ports.metrics.clone(),
        ));
        let cache = Arc::new(CacheLayer::new(
            config.cache.clone(),
            ports.remote_cache.clone(),
            ports.metrics.clone(),
        ));
        let dispatcher = Arc::new(
            Dispatcher::new(
                config.clone(),
                registry.clone(),
                pools.clone(),
                breakers.clone(),
                cache.clone(),
                ports.metrics.clone(),
            )
            .wrap_err("Failed to build dispatcher")?,
        );
        let health_checker = Arc::new(HealthChecker::new(
            registry.clone(),
            ports.health_probe.clone(),
            config.clone(),
            ports.metrics.clone(),
        ));

        tracing::info!(
            services = config.services.len(),
            remote_cache = ports.remote_cache.as_ref().map(|r| r.name()),
            cache_enabled = config.cache.enabled,
            "Traffic core initialized"
        );

        Ok(Self {
            config,
            registry,
            breakers,
            pools,
            cache,
            dispatcher,
            health_checker,
            loops: Mutex::new(Vec::new()),
        })
    }

    /// Launch the background loops. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return;
        }
        if let Some(health) = self.health_checker.clone().spawn() {
            loops.push(health);
        }
        drop(loops);

        self.pools.start();
        self.cache.start();
        tracing::info!("Traffic core started");
    }

    /// Stop admitting calls, then cancel and await every background loop.
    /// Calls already in flight finish under their own timeouts.
    pub async fn stop(&self) {
        self.dispatcher.begin_shutdown();

        let loops: Vec<BackgroundLoop> = self.loops.lock().drain(..).collect();
        for background in loops {
            background.stop().await;
        }
        self.pools.stop().await;
        self.cache.stop().await;
        tracing::info!("Traffic core stopped");
    }

    /// Dispatch one call to `service`.
    pub async fn dispatch(
        &self,
        service: &str,
        request: DownstreamRequest,
    ) -> Result<DownstreamResponse, DispatchError> {
        self.dispatcher.dispatch(service, request).await
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health_checker
    }
}
