//! Per-service connection pools and their usage statistics.
//!
//! Each service gets one pooled client, built lazily through the
//! [`ClientFactory`] port with that service's limits. The total-connection
//! ceiling is enforced with a semaphore: every lease holds a permit until it is
//! dropped.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use scc::HashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    config::{GatewayConfig, PoolConfig},
    ports::{
        ClientFactory, DownstreamClient, DownstreamRequest, DownstreamResponse, MetricsSink,
        TransportResult,
    },
    utils::background::BackgroundLoop,
};

/// Smoothing factor of the response-time moving average.
pub const EMA_ALPHA: f64 = 0.1;

#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum PoolError {
    #[error("Connection pool for '{service}' is exhausted ({limit} connections in use)")]
    Exhausted { service: String, limit: usize },

    #[error("Connection pool manager is stopped")]
    Closed,

    #[error("Failed to build client for '{service}': {message}")]
    Build { service: String, message: String },
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Exponential moving average step; the first sample initializes the average.
pub fn ema(previous: Option<f64>, sample: f64) -> f64 {
    match previous {
        Some(avg) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * avg,
        None => sample,
    }
}

/// Point-in-time statistics for one service's pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub service: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time_ms: Option<f64>,
    pub in_use: usize,
    pub max_connections: usize,
    pub age: Duration,
    pub idle_for: Duration,
}

impl PoolStats {
    pub fn success_rate(&self) -> Option<f64> {
        (self.total_requests > 0)
            .then(|| self.successful_requests as f64 / self.total_requests as f64)
    }
}

/// Pools touched by one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Idle pools whose client was rebuilt to drop idle connections
    pub shrunk: Vec<String>,
    /// Pools flagged for a low success rate
    pub low_success: Vec<String>,
    /// Pools flagged for a high average response time
    pub slow: Vec<String>,
}

struct UsageStats {
    total: u64,
    success: u64,
    failure: u64,
    ema_ms: Option<f64>,
    created_at: Instant,
    last_used: Instant,
    /// Cleared on the next use, so an idle pool is only shrunk once
    shrunk: bool,
}

struct ServicePool {
    limits: PoolConfig,
    client: RwLock<Arc<dyn DownstreamClient>>,
    permits: Arc<Semaphore>,
    stats: Mutex<UsageStats>,
}

impl ServicePool {
    fn in_use(&self) -> usize {
        self.limits
            .max_connections
            .saturating_sub(self.permits.available_permits())
    }

    fn snapshot(&self, service: &str, now: Instant) -> PoolStats {
        let stats = self.stats.lock();
        PoolStats {
            service: service.to_string(),
            total_requests: stats.total,
            successful_requests: stats.success,
            failed_requests: stats.failure,
            avg_response_time_ms: stats.ema_ms,
            in_use: self.in_use(),
            max_connections: self.limits.max_connections,
            age: now.saturating_duration_since(stats.created_at),
            idle_for: now.saturating_duration_since(stats.last_used),
        }
    }
}

/// A leased client. Holds one connection slot until dropped.
pub struct PooledClient {
    service: String,
    client: Arc<dyn DownstreamClient>,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Send `request` to the instance at `base_url` through the pooled client.
    pub async fn send(
        &self,
        base_url: &str,
        request: &DownstreamRequest,
    ) -> TransportResult<DownstreamResponse> {
        self.client.send(base_url, request).await
    }
}

pub struct ConnectionPoolManager {
    config: Arc<GatewayConfig>,
    factory: Arc<dyn ClientFactory>,
    metrics: Arc<dyn MetricsSink>,
    pools: HashMap<String, Arc<ServicePool>>,
    closed: AtomicBool,
    loops: Mutex<Vec<BackgroundLoop>>,
}

impl ConnectionPoolManager {
    pub fn new(
        config: Arc<GatewayConfig>,
        factory: Arc<dyn ClientFactory>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            factory,
            metrics,
            pools: HashMap::new(),
            closed: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Lease the pooled client for `service`, creating the pool on first use.
    ///
    /// Pools are keyed by service; the instance base URL is supplied per request
    /// to [`PooledClient::send`].
    pub async fn acquire(&self, service: &str) -> PoolResult<PooledClient> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let pool = self.pool(service).await?;
        let permit = pool
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| PoolError::Exhausted {
                service: service.to_string(),
                limit: pool.limits.max_connections,
            })?;

        {
            let mut stats = pool.stats.lock();
            stats.last_used = Instant::now();
            stats.shrunk = false;
        }

        Ok(PooledClient {
            service: service.to_string(),
            client: pool.client.read().clone(),
            _permit: permit,
        })
    }

    /// Record the outcome of one call made through the service's pool.
    pub async fn record_request(&self, service: &str, success: bool, response_time_ms: f64) {
        let Some(pool) = self.existing(service).await else {
            tracing::debug!(service, "Request recorded for unknown pool, ignoring");
            return;
        };

        let avg = {
            let mut stats = pool.stats.lock();
            stats.total += 1;
            if success {
                stats.success += 1;
            } else {
                stats.failure += 1;
            }
            stats.ema_ms = Some(ema(stats.ema_ms, response_time_ms));
            stats.last_used = Instant::now();
            stats.ema_ms.unwrap_or(response_time_ms)
        };
        self.metrics.pool_usage(service, pool.in_use(), avg);
    }

    pub async fn stats(&self, service: &str) -> Option<PoolStats> {
        let pool = self.existing(service).await?;
        Some(pool.snapshot(service, Instant::now()))
    }

    pub async fn all_stats(&self) -> Vec<PoolStats> {
        let now = Instant::now();
        let mut all = Vec::new();
        self.pools
            .retain_async(|service, pool| {
                all.push(pool.snapshot(service, now));
                true
            })
            .await;
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// One maintenance pass. Each optimization is independent; a failure in one
    /// is logged and does not stop the others.
    pub async fn maintain(&self) -> MaintenanceReport {
        self.maintain_at(Instant::now()).await
    }

    /// Clock-explicit variant of [`ConnectionPoolManager::maintain`].
    pub async fn maintain_at(&self, now: Instant) -> MaintenanceReport {
        let settings = &self.config.pool_maintenance;
        let idle_shrink = Duration::from_secs(settings.idle_shrink_secs);

        let mut pools = Vec::new();
        self.pools
            .retain_async(|service, pool| {
                pools.push((service.clone(), pool.clone()));
                true
            })
            .await;

        let mut report = MaintenanceReport::default();
        for (service, pool) in pools {
            let snapshot = pool.snapshot(&service, now);
            let shrink_due = {
                let stats = pool.stats.lock();
                !stats.shrunk && snapshot.idle_for > idle_shrink && snapshot.in_use == 0
            };
            if shrink_due {
                match self.factory.build(&service, &pool.limits) {
                    Ok(client) => {
                        *pool.client.write() = client;
                        pool.stats.lock().shrunk = true;
                        tracing::info!(
                            service = %service,
                            idle_secs = snapshot.idle_for.as_secs(),
                            "Shrunk idle connection pool"
                        );
                        report.shrunk.push(service.clone());
                    }
                    Err(e) => {
                        tracing::warn!(service = %service, "Failed to shrink idle pool: {:#}", e);
                    }
                }
            }

            if snapshot.total_requests >= settings.min_requests_for_flagging {
                if let Some(rate) = snapshot.success_rate() {
                    if rate < settings.min_success_rate {
                        tracing::warn!(
                            service = %service,
                            success_rate = rate,
                            requests = snapshot.total_requests,
                            "Connection pool has a low success rate, investigate the service"
                        );
                        report.low_success.push(service.clone());
                    }
                }
            }

            if let Some(avg) = snapshot.avg_response_time_ms {
                if avg > settings.slow_pool_threshold_ms {
                    tracing::warn!(
                        service = %service,
                        avg_response_time_ms = avg,
                        "Connection pool average response time is high"
                    );
                    report.slow.push(service.clone());
                }
            }
        }
        report
    }

    /// Delete pools (and their statistics) untouched for longer than the stale
    /// limit. Returns the number removed.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    /// Clock-explicit variant of [`ConnectionPoolManager::sweep`].
    pub async fn sweep_at(&self, now: Instant) -> usize {
        let stale_after = Duration::from_secs(self.config.pool_maintenance.stale_after_secs);
        let mut removed = 0;
        self.pools
            .retain_async(|service, pool| {
                let idle_for = now.saturating_duration_since(pool.stats.lock().last_used);
                let stale = idle_for > stale_after && pool.in_use() == 0;
                if stale {
                    tracing::info!(
                        service = %service,
                        idle_secs = idle_for.as_secs(),
                        "Removing stale connection pool"
                    );
                    removed += 1;
                }
                !stale
            })
            .await;
        removed
    }

    /// Launch the maintenance and stale-sweep loops.
    pub fn start(self: &Arc<Self>) {
        let settings = &self.config.pool_maintenance;
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return;
        }

        let manager = self.clone();
        loops.push(BackgroundLoop::spawn(
            "pool-maintenance",
            Duration::from_secs(settings.interval_secs),
            move || {
                let manager = manager.clone();
                async move {
                    let report = manager.maintain().await;
                    tracing::debug!(
                        shrunk = report.shrunk.len(),
                        low_success = report.low_success.len(),
                        slow = report.slow.len(),
                        "Pool maintenance completed"
                    );
                }
            },
        ));

        let manager = self.clone();
        loops.push(BackgroundLoop::spawn(
            "pool-sweep",
            Duration::from_secs(settings.sweep_interval_secs),
            move || {
                let manager = manager.clone();
                async move {
                    manager.sweep().await;
                }
            },
        ));
        tracing::info!("Connection pool manager started");
    }

    /// Stop handing out leases and stop the background loops. Leases already
    /// handed out stay valid until dropped.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::Release);
        let loops: Vec<BackgroundLoop> = self.loops.lock().drain(..).collect();
        for background in loops {
            background.stop().await;
        }
        tracing::info!("Connection pool manager stopped");
    }

    async fn pool(&self, service: &str) -> PoolResult<Arc<ServicePool>> {
        if let Some(pool) = self.existing(service).await {
            return Ok(pool);
        }

        let limits = self.config.pool_for(service).clone();
        let client = self
            .factory
            .build(service, &limits)
            .map_err(|e| PoolError::Build {
                service: service.to_string(),
                message: format!("{e:#}"),
            })?;

        let now = Instant::now();
        let created = Arc::new(ServicePool {
            permits: Arc::new(Semaphore::new(limits.max_connections)),
            client: RwLock::new(client),
            stats: Mutex::new(UsageStats {
                total: 0,
                success: 0,
                failure: 0,
                ema_ms: None,
                created_at: now,
                last_used: now,
                shrunk: false,
            }),
            limits,
        });

        // a concurrent caller may have won the race; keep whichever landed first
        let pool = self
            .pools
            .entry_async(service.to_string())
            .await
            .or_insert_with(|| {
                tracing::debug!(
                    service,
                    max_connections = created.limits.max_connections,
                    "Created connection pool"
                );
                created.clone()
            })
            .get()
            .clone();
        Ok(pool)
    }

    async fn existing(&self, service: &str) -> Option<Arc<ServicePool>> {
        self.pools
            .get_async(service)
            .await
            .map(|entry| entry.get().clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use http::StatusCode;

    use super::*;
    use crate::ports::NoopMetrics;

    struct EchoClient;

    #[async_trait]
    impl DownstreamClient for EchoClient {
        async fn send(
            &self,
            _base_url: &str,
            request: &DownstreamRequest,
        ) -> TransportResult<DownstreamResponse> {
            Ok(DownstreamResponse::new(StatusCode::OK, request.path.clone()))
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        builds: AtomicUsize,
    }

    impl ClientFactory for CountingFactory {
        fn build(
            &self,
            _service: &str,
            _limits: &PoolConfig,
        ) -> eyre::Result<Arc<dyn DownstreamClient>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EchoClient))
        }
    }

    fn manager_with(config: GatewayConfig) -> (Arc<ConnectionPoolManager>, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory::default());
        let manager = Arc::new(ConnectionPoolManager::new(
            Arc::new(config),
            factory.clone(),
            Arc::new(NoopMetrics),
        ));
        (manager, factory)
    }

    #[test]
    fn test_ema_converges_and_dampens_outliers() {
        let mut avg = None;
        for sample in [100.0, 100.0, 100.0] {
            avg = Some(ema(avg, sample));
        }
        assert!((avg.unwrap() - 100.0).abs() < 1e-9);

        let after_outlier = ema(avg, 1000.0);
        assert!((after_outlier - 190.0).abs() < 1e-9);
        assert!(after_outlier - 100.0 < 900.0);
    }

    #[tokio::test]
    async fn test_pool_is_created_once_per_service() {
        let (manager, factory) = manager_with(GatewayConfig::default());

        let lease = manager.acquire("gen").await.unwrap();
        drop(lease);
        let _again = manager.acquire("gen").await.unwrap();
        let _other = manager.acquire("render").await.unwrap();

        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
        assert_eq!(manager.all_stats().await.len(), 2);
    }

    #[tokio::test]
    async fn test_lease_round_trip() {
        let (manager, _) = manager_with(GatewayConfig::default());
        let lease = manager.acquire("gen").await.unwrap();
        let response = lease
            .send("http://gen-1:8000", &DownstreamRequest::get("/ping"))
            .await
            .unwrap();
        assert_eq!(response.body, "/ping");
        assert_eq!(lease.service(), "gen");
    }

    #[tokio::test]
    async fn test_exhaustion_uses_per_service_limit() {
        let mut config = GatewayConfig::default();
        config.pool_overrides.insert(
            "gen".to_string(),
            PoolConfig {
                max_connections: 2,
                ..PoolConfig::default()
            },
        );
        let (manager, _) = manager_with(config);

        let first = manager.acquire("gen").await.unwrap();
        let _second = manager.acquire("gen").await.unwrap();
        assert_eq!(manager.stats("gen").await.unwrap().in_use, 2);

        let exhausted = manager.acquire("gen").await;
        assert!(matches!(
            exhausted,
            Err(PoolError::Exhausted { ref service, limit: 2 }) if service == "gen"
        ));

        drop(first);
        assert!(manager.acquire("gen").await.is_ok());
    }

    #[tokio::test]
    async fn test_record_request_tracks_counts_and_ema() {
        let (manager, _) = manager_with(GatewayConfig::default());
        let _lease = manager.acquire("gen").await.unwrap();

        for _ in 0..3 {
            manager.record_request("gen", true, 100.0).await;
        }
        manager.record_request("gen", false, 1000.0).await;

        let stats = manager.stats("gen").await.unwrap();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.success_rate(), Some(0.75));
        let avg = stats.avg_response_time_ms.unwrap();
        assert!((avg - 190.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_maintenance_shrinks_once_and_flags() {
        let (manager, factory) = manager_with(GatewayConfig::default());
        drop(manager.acquire("flaky").await.unwrap());
        drop(manager.acquire("sluggish").await.unwrap());

        for i in 0..10 {
            manager.record_request("flaky", i < 3, 50.0).await;
        }
        manager.record_request("sluggish", true, 12_000.0).await;

        let now = Instant::now();
        let report = manager.maintain_at(now).await;
        assert_eq!(report.low_success, vec!["flaky".to_string()]);
        assert_eq!(report.slow, vec!["sluggish".to_string()]);
        assert!(report.shrunk.is_empty());

        let later = now + Duration::from_secs(301);
        let report = manager.maintain_at(later).await;
        assert_eq!(report.shrunk.len(), 2);
        assert_eq!(factory.builds.load(Ordering::SeqCst), 4);

        let report = manager.maintain_at(later).await;
        assert!(report.shrunk.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_pools_only() {
        let (manager, _) = manager_with(GatewayConfig::default());
        drop(manager.acquire("old").await.unwrap());
        let _held = manager.acquire("busy").await.unwrap();

        let later = Instant::now() + Duration::from_secs(3_601);
        assert_eq!(manager.sweep_at(later).await, 1);
        assert!(manager.stats("old").await.is_none());
        assert!(manager.stats("busy").await.is_some());
    }

    #[tokio::test]
    async fn test_stop_refuses_new_leases() {
        let (manager, _) = manager_with(GatewayConfig::default());
        manager.start();
        let lease = manager.acquire("gen").await.unwrap();

        manager.stop().await;
        assert!(manager.is_closed());
        assert_eq!(manager.acquire("gen").await.err(), Some(PoolError::Closed));
        // existing leases remain usable
        assert!(lease.send("http://gen-1", &DownstreamRequest::get("/")).await.is_ok());
    }
}
