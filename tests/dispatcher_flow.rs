use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use http::{HeaderValue, StatusCode, header::AUTHORIZATION};
use sluice::{
    DispatchError, TrafficCore, TrafficPorts,
    config::{CacheRule, GatewayConfig, PoolConfig},
    core::{CircuitState, FailureKind, ResponseClass},
    ports::{
        ClientFactory, DownstreamClient, DownstreamRequest, DownstreamResponse, HealthProbe,
        TransportError, TransportResult,
    },
};

/// What the fake downstream answers with.
#[derive(Clone, Copy)]
enum Behaviour {
    Ok,
    Timeout,
    Status(StatusCode),
    Slow(Duration),
}

struct FakeClient {
    behaviour: Behaviour,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl DownstreamClient for FakeClient {
    async fn send(
        &self,
        base_url: &str,
        request: &DownstreamRequest,
    ) -> TransportResult<DownstreamResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::Ok => Ok(DownstreamResponse::new(
                StatusCode::OK,
                format!("{base_url}{}", request.path),
            )),
            Behaviour::Timeout => Err(TransportError::Timeout(Duration::from_secs(30))),
            Behaviour::Status(status) => Ok(DownstreamResponse::new(status, "nope")),
            Behaviour::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(DownstreamResponse::new(StatusCode::OK, "slow"))
            }
        }
    }
}

struct FakeFactory {
    behaviour: Behaviour,
    calls: Arc<AtomicUsize>,
}

impl ClientFactory for FakeFactory {
    fn build(
        &self,
        _service: &str,
        _limits: &PoolConfig,
    ) -> eyre::Result<Arc<dyn DownstreamClient>> {
        Ok(Arc::new(FakeClient {
            behaviour: self.behaviour,
            calls: self.calls.clone(),
        }))
    }
}

struct NeverProbed;

#[async_trait]
impl HealthProbe for NeverProbed {
    async fn probe(&self, _url: &str, _timeout: Duration) -> TransportResult<bool> {
        Ok(true)
    }
}

async fn core_with(config: GatewayConfig, behaviour: Behaviour) -> (TrafficCore, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let factory = Arc::new(FakeFactory {
        behaviour,
        calls: calls.clone(),
    });
    let core = TrafficCore::new(config, TrafficPorts::new(factory, Arc::new(NeverProbed)))
        .await
        .unwrap();
    (core, calls)
}

fn gen_config() -> GatewayConfig {
    GatewayConfig::builder()
        .service("gen", "gen-1", "http://gen-1:8000")
        .build()
}

#[tokio::test]
async fn test_repeated_timeouts_open_the_circuit_after_the_sixth() {
    let (core, calls) = core_with(gen_config(), Behaviour::Timeout).await;

    let breaker = core.breakers().get("gen").await;
    // Six consecutive failures put the cool-down one multiplier step above base
    let cool_down = breaker.recovery_timeout(6);
    assert_eq!(cool_down, Duration::from_secs(60));

    let mut results = Vec::new();
    for _ in 0..12 {
        results.push(core.dispatch("gen", DownstreamRequest::get("/generate")).await);
    }

    for result in &results[..6] {
        match result {
            Err(DispatchError::Downstream { kind, status, .. }) => {
                assert_eq!(*kind, FailureKind::Timeout);
                assert_eq!(*status, None);
            }
            other => panic!("expected a downstream timeout, got {other:?}"),
        }
    }
    for result in &results[6..] {
        match result {
            Err(e @ DispatchError::CircuitOpen { retry_after, .. }) => {
                assert_eq!(e.response_class(), ResponseClass::Unavailable);
                assert!(*retry_after <= cool_down);
                assert!(*retry_after > cool_down - Duration::from_secs(5));
            }
            other => panic!("expected an open circuit, got {other:?}"),
        }
    }

    // The instance is only contacted while the circuit is closed
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(breaker.state(), CircuitState::Open);

    let pool = core.pools().stats("gen").await.unwrap();
    assert_eq!(pool.total_requests, 6);
    assert_eq!(pool.failed_requests, 6);
}

#[tokio::test]
async fn test_server_errors_are_reported_with_status() {
    let (core, _) = core_with(gen_config(), Behaviour::Status(StatusCode::BAD_GATEWAY)).await;

    let err = core
        .dispatch("gen", DownstreamRequest::get("/generate"))
        .await
        .unwrap_err();
    match err {
        DispatchError::Downstream { status, kind, .. } => {
            assert_eq!(status, Some(StatusCode::BAD_GATEWAY));
            assert_eq!(kind, FailureKind::Http5xx);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_service_has_no_instance() {
    let (core, calls) = core_with(gen_config(), Behaviour::Ok).await;

    let err = core
        .dispatch("img", DownstreamRequest::get("/render"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoHealthyInstance { ref service } if service == "img"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_matching_rule_serves_second_call_from_cache() {
    let config = GatewayConfig::builder()
        .service("gen", "gen-1", "http://gen-1:8000")
        .cache_rule(CacheRule {
            ttl: Some("1m".to_string()),
            tags: vec!["models".to_string()],
            ..CacheRule::get("/models/**")
        })
        .build();
    let (core, calls) = core_with(config, Behaviour::Ok).await;

    let first = core
        .dispatch("gen", DownstreamRequest::get("/models/llama?b=2&a=1"))
        .await
        .unwrap();
    let second = core
        .dispatch("gen", DownstreamRequest::get("/models//llama/?a=1&b=2"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(core.cache().stats().hits, 1);

    // Tag invalidation forces the next call back to the instance
    assert_eq!(core.cache().invalidate_by_tag(&["models"]).await, 1);
    core.dispatch("gen", DownstreamRequest::get("/models/llama?a=1&b=2"))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_requests_without_rule_or_with_credentials_bypass_cache() {
    let config = GatewayConfig::builder()
        .service("gen", "gen-1", "http://gen-1:8000")
        .cache_rule(CacheRule::get("/models/**"))
        .build();
    let (core, calls) = core_with(config, Behaviour::Ok).await;

    for _ in 0..2 {
        core.dispatch("gen", DownstreamRequest::get("/generate"))
            .await
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    for _ in 0..2 {
        let mut request = DownstreamRequest::get("/models/llama");
        request
            .headers
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        core.dispatch("gen", request).await.unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(core.cache().stats().sets, 0);
}

#[tokio::test]
async fn test_full_pool_is_backpressure() {
    let mut config = gen_config();
    config.pool.max_connections = 1;
    let (core, _) = core_with(config, Behaviour::Slow(Duration::from_millis(200))).await;
    let core = Arc::new(core);

    let busy = {
        let core = core.clone();
        tokio::spawn(async move { core.dispatch("gen", DownstreamRequest::get("/slow")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = core
        .dispatch("gen", DownstreamRequest::get("/slow"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::PoolExhausted { limit: 1, .. }));
    assert_eq!(err.response_class(), ResponseClass::Backpressure);

    assert!(busy.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_no_calls_start_after_stop() {
    let (core, calls) = core_with(gen_config(), Behaviour::Ok).await;
    core.start();
    core.stop().await;

    let err = core
        .dispatch("gen", DownstreamRequest::get("/generate"))
        .await
        .unwrap_err();
    assert_eq!(err.response_class(), ResponseClass::ShuttingDown);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_open_circuit_is_reported_before_pool_backpressure() {
    let mut config = gen_config();
    config.pool.max_connections = 1;
    let (core, calls) = core_with(config, Behaviour::Timeout).await;

    for _ in 0..6 {
        let _ = core.dispatch("gen", DownstreamRequest::get("/generate")).await;
    }
    assert_eq!(core.breakers().get("gen").await.state(), CircuitState::Open);

    // Hold the only connection so a pool lease would fail
    let _held = core.pools().acquire("gen").await.unwrap();
    let err = core
        .dispatch("gen", DownstreamRequest::get("/generate"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::CircuitOpen { .. }));
    assert_eq!(err.response_class(), ResponseClass::Unavailable);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_parameterised_routes_share_one_adaptive_entry() {
    let config = GatewayConfig::builder()
        .service("gen", "gen-1", "http://gen-1:8000")
        .cache_rule(CacheRule::get("/jobs/*"))
        .build();
    let (core, _) = core_with(config, Behaviour::Ok).await;

    for id in 1..=3 {
        core.dispatch("gen", DownstreamRequest::get(format!("/jobs/{id}")))
            .await
            .unwrap();
    }

    let endpoints = core.cache().adaptive().snapshot().await;
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].endpoint, "gen:GET:/jobs/*");
    assert_eq!(endpoints[0].accesses, 3);
}
