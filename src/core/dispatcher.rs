//! Per-call orchestration: cache lookup, instance selection, pooled client
//! lease, breaker-guarded invocation, cache population and statistics.
//!
//! The dispatcher never retries. Every failure is reported once, typed, and
//! annotated with the service name.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use eyre::{Result, WrapErr};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header::AUTHORIZATION};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::{
    config::{CacheRule, GatewayConfig},
    core::{
        cache::CacheLayer,
        circuit_breaker::{
            BreakerError, CircuitBreakers, ClassifyFailure, FailureKind, Observation, classify,
        },
        error::DispatchError,
        pool::{ConnectionPoolManager, PoolError},
        registry::ServiceRegistry,
    },
    ports::{DownstreamRequest, DownstreamResponse, MetricsSink, RequestOutcome, TransportError},
    tracing_setup::{create_dispatch_span, create_downstream_span},
    utils::pattern::path_glob,
};

/// Collapse duplicate slashes, strip a trailing slash and sort query parameters.
pub fn normalize_path(raw: &str) -> String {
    let (path, query) = match raw.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (raw, None),
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut normalized = format!("/{}", segments.join("/"));

    if let Some(query) = query {
        let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
        if !params.is_empty() {
            params.sort_unstable();
            normalized.push('?');
            normalized.push_str(&params.join("&"));
        }
    }
    normalized
}

/// Deterministic cache key: `{service}:{METHOD}:{normalized path}` followed by
/// `:{h=v&...}` for the configured headers present on the request.
pub fn cache_key(
    service: &str,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    key_headers: &[String],
) -> String {
    let mut key = format!("{service}:{}:{}", method.as_str(), normalize_path(path));

    let mut names: Vec<String> = key_headers.iter().map(|h| h.to_ascii_lowercase()).collect();
    names.sort();
    names.dedup();
    let parts: Vec<String> = names
        .iter()
        .filter_map(|name| {
            let value = headers.get(name.as_str())?.to_str().ok()?;
            Some(format!("{name}={value}"))
        })
        .collect();
    if !parts.is_empty() {
        key.push(':');
        key.push_str(&parts.join("&"));
    }
    key
}

/// Cached form of a downstream response. The body is base64 so the whole
/// record stays valid JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CachedResponse {
    pub fn from_response(response: &DownstreamResponse) -> Self {
        Self {
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
                })
                .collect(),
            body: STANDARD.encode(&response.body),
        }
    }

    pub fn into_response(self) -> Option<DownstreamResponse> {
        let status = StatusCode::from_u16(self.status).ok()?;
        let body = STANDARD.decode(self.body.as_bytes()).ok()?;
        let mut headers = HeaderMap::new();
        for (name, value) in self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
            let value = HeaderValue::from_str(&value).ok()?;
            headers.append(name, value);
        }
        Some(DownstreamResponse {
            status,
            headers,
            body: Bytes::from(body),
        })
    }
}

struct CompiledRule {
    methods: Vec<Method>,
    /// Glob as configured; names the endpoint for adaptive TTL statistics
    pattern: String,
    path: Regex,
    ttl: Option<Duration>,
    cache_authenticated: bool,
    tags: Vec<String>,
}

impl CompiledRule {
    fn compile(rule: &CacheRule) -> Result<Self> {
        let methods = rule
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .wrap_err_with(|| format!("Invalid cache rule method: {m}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let path = path_glob(&rule.path)
            .wrap_err_with(|| format!("Invalid cache rule path: {}", rule.path))?;
        Ok(Self {
            methods,
            pattern: rule.path.clone(),
            path,
            ttl: rule.ttl(),
            cache_authenticated: rule.cache_authenticated,
            tags: rule.tags.clone(),
        })
    }

    fn matches(&self, method: &Method, path: &str, authenticated: bool) -> bool {
        self.methods.contains(method)
            && self.path.is_match(path)
            && (self.cache_authenticated || !authenticated)
    }
}

/// Why a breaker-guarded call failed.
enum CallFailure {
    Transport(TransportError),
    /// The service answered with a 4xx/5xx status
    Status(DownstreamResponse),
}

impl ClassifyFailure for CallFailure {
    fn observation(&self) -> Observation {
        match self {
            CallFailure::Transport(e) => e.observation(),
            CallFailure::Status(response) => Observation::Status(response.status),
        }
    }
}

pub struct Dispatcher {
    config: Arc<GatewayConfig>,
    registry: Arc<ServiceRegistry>,
    pools: Arc<ConnectionPoolManager>,
    breakers: Arc<CircuitBreakers>,
    cache: Arc<CacheLayer>,
    metrics: Arc<dyn MetricsSink>,
    rules: Vec<CompiledRule>,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        config: Arc<GatewayConfig>,
        registry: Arc<ServiceRegistry>,
        pools: Arc<ConnectionPoolManager>,
        breakers: Arc<CircuitBreakers>,
        cache: Arc<CacheLayer>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let rules = config
            .dispatcher
            .cache_rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            registry,
            pools,
            breakers,
            cache,
            metrics,
            rules,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Stop admitting new calls. Calls already past admission run to completion.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Dispatch one outbound call to `service`.
    pub async fn dispatch(
        &self,
        service: &str,
        request: DownstreamRequest,
    ) -> Result<DownstreamResponse, DispatchError> {
        let span = create_dispatch_span(service, request.method.as_str(), &request.path);
        let started = Instant::now();
        let result = self
            .dispatch_inner(service, request)
            .instrument(span.clone())
            .await;

        let elapsed = started.elapsed();
        span.record("duration_ms", elapsed.as_secs_f64() * 1000.0);
        let outcome = match &result {
            Ok((_, true)) => RequestOutcome::CacheHit,
            Ok((_, false)) => RequestOutcome::Success,
            Err(DispatchError::CircuitOpen { .. }) => RequestOutcome::CircuitOpen,
            Err(DispatchError::NoHealthyInstance { .. }) => RequestOutcome::NoInstance,
            Err(DispatchError::PoolExhausted { .. }) => RequestOutcome::PoolExhausted,
            Err(DispatchError::Downstream { .. }) => RequestOutcome::DownstreamFailure,
            Err(DispatchError::ShuttingDown { .. }) => RequestOutcome::Rejected,
        };
        self.metrics.request_outcome(service, outcome, elapsed);

        result.map(|(response, _)| response)
    }

    /// Returns the response and whether it came from the cache.
    async fn dispatch_inner(
        &self,
        service: &str,
        request: DownstreamRequest,
    ) -> Result<(DownstreamResponse, bool), DispatchError> {
        if self.is_shutting_down() {
            return Err(DispatchError::ShuttingDown {
                service: service.to_string(),
            });
        }

        let normalized = normalize_path(&request.path);
        let route = normalized.split('?').next().unwrap_or("/");
        let authenticated = request.headers.contains_key(AUTHORIZATION);
        let rule = if self.cache.is_enabled() {
            self.rules
                .iter()
                .find(|rule| rule.matches(&request.method, route, authenticated))
        } else {
            None
        };
        // Usage is tracked per rule so parameterised routes share one entry
        let endpoint = rule
            .map(|rule| format!("{service}:{}:{}", request.method, rule.pattern))
            .unwrap_or_default();
        let key = rule.map(|_| {
            cache_key(
                service,
                &request.method,
                &request.path,
                &request.headers,
                &self.config.dispatcher.cache_key_headers,
            )
        });

        if let Some(key) = &key {
            let lookup_started = Instant::now();
            if let Some(response) = self.cached_response(key).await {
                let lookup_ms = lookup_started.elapsed().as_secs_f64() * 1000.0;
                self.cache.adaptive().record(&endpoint, true, lookup_ms).await;
                tracing::Span::current().record("cache", "hit");
                tracing::debug!(key = %key, "Served from cache");
                return Ok((response, true));
            }
            tracing::Span::current().record("cache", "miss");
        }

        let instance = self.registry.best_instance(service).await.ok_or_else(|| {
            DispatchError::NoHealthyInstance {
                service: service.to_string(),
            }
        })?;
        tracing::Span::current().record("instance", instance.name.as_str());

        // An open circuit refuses before the pool is touched
        let breaker = self.breakers.get(service).await;
        let retry_after = breaker.retry_after();
        if !retry_after.is_zero() {
            tracing::debug!(service, ?retry_after, "Circuit open, call refused");
            return Err(DispatchError::CircuitOpen {
                service: service.to_string(),
                retry_after,
            });
        }

        let lease = self.pools.acquire(service).await.map_err(|e| match e {
            PoolError::Exhausted { limit, .. } => DispatchError::PoolExhausted {
                service: service.to_string(),
                limit,
            },
            PoolError::Closed => DispatchError::ShuttingDown {
                service: service.to_string(),
            },
            other => DispatchError::Downstream {
                service: service.to_string(),
                status: None,
                kind: FailureKind::Connection,
                message: other.to_string(),
            },
        })?;

        let downstream_span = create_downstream_span(service, &instance.name, &instance.url);
        let started = Instant::now();
        let result = breaker
            .execute(|| async {
                match lease.send(&instance.url, &request).await {
                    Ok(response)
                        if response.status.is_client_error()
                            || response.status.is_server_error() =>
                    {
                        Err(CallFailure::Status(response))
                    }
                    Ok(response) => Ok(response),
                    Err(e) => Err(CallFailure::Transport(e)),
                }
            })
            .instrument(downstream_span.clone())
            .await;
        drop(lease);

        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        downstream_span.record("duration_ms", elapsed_ms);

        match result {
            Ok(response) => {
                downstream_span.record("http.status_code", response.status.as_u16());
                tracing::Span::current().record("http.status_code", response.status.as_u16());
                self.pools.record_request(service, true, elapsed_ms).await;

                if let (Some(key), Some(rule)) = (&key, rule) {
                    self.cache.adaptive().record(&endpoint, false, elapsed_ms).await;
                    if response.status.is_success() {
                        self.populate_cache(key, &endpoint, rule, &response).await;
                    }
                }
                Ok((response, false))
            }
            Err(BreakerError::Open { retry_after, .. }) => {
                tracing::debug!(service, ?retry_after, "Circuit open, call refused");
                Err(DispatchError::CircuitOpen {
                    service: service.to_string(),
                    retry_after,
                })
            }
            Err(BreakerError::Call(failure)) => {
                self.pools.record_request(service, false, elapsed_ms).await;
                let slow = self.config.breaker_for(service).slow_response_threshold();
                let kind = classify(failure.observation(), elapsed, slow)
                    .unwrap_or(FailureKind::Connection);
                let (status, message) = match failure {
                    CallFailure::Status(response) => {
                        downstream_span.record("http.status_code", response.status.as_u16());
                        let message =
                            format!("instance '{}' returned {}", instance.name, response.status);
                        (Some(response.status), message)
                    }
                    CallFailure::Transport(e) => {
                        (None, format!("instance '{}': {e}", instance.name))
                    }
                };
                tracing::warn!(
                    service,
                    instance = %instance.name,
                    failure_kind = %kind,
                    "Downstream call failed: {}",
                    message
                );
                Err(DispatchError::Downstream {
                    service: service.to_string(),
                    status,
                    kind,
                    message,
                })
            }
        }
    }

    async fn cached_response(&self, key: &str) -> Option<DownstreamResponse> {
        let cached: CachedResponse = self.cache.get_json(key).await?;
        let response = cached.into_response();
        if response.is_none() {
            tracing::warn!(key, "Discarding malformed cached response");
        }
        response
    }

    async fn populate_cache(
        &self,
        key: &str,
        endpoint: &str,
        rule: &CompiledRule,
        response: &DownstreamResponse,
    ) {
        let ttl = match rule.ttl {
            Some(ttl) => ttl,
            None => self.cache.adaptive().ttl_for(endpoint).await,
        };
        let tags: Vec<&str> = rule.tags.iter().map(String::as_str).collect();
        let cached = CachedResponse::from_response(response);
        if let Err(e) = self.cache.set_json(key, &cached, Some(ttl), &tags).await {
            tracing::warn!(key, "Failed to cache response: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/v1//models/"), "/v1/models");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/search?q=cat&a=1"), "/search?a=1&q=cat");
        assert_eq!(normalize_path("/search?"), "/search");
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let mut headers = HeaderMap::new();
        headers.insert("Accept-Language", HeaderValue::from_static("en"));
        headers.insert("x-tenant", HeaderValue::from_static("acme"));
        let key_headers = vec!["X-Tenant".to_string(), "accept-language".to_string()];

        let a = cache_key("gen", &Method::GET, "/m?b=2&a=1", &headers, &key_headers);
        let b = cache_key("gen", &Method::GET, "//m/?a=1&b=2", &headers, &key_headers);
        assert_eq!(a, b);
        assert_eq!(a, "gen:GET:/m?a=1&b=2:accept-language=en&x-tenant=acme");

        let bare = cache_key("gen", &Method::GET, "/m", &HeaderMap::new(), &key_headers);
        assert_eq!(bare, "gen:GET:/m");
    }

    #[test]
    fn test_cached_response_round_trip() {
        let mut response = DownstreamResponse::new(StatusCode::OK, vec![0u8, 159, 146, 150]);
        response
            .headers
            .insert("content-type", HeaderValue::from_static("application/octet-stream"));

        let json = serde_json::to_string(&CachedResponse::from_response(&response)).unwrap();
        let restored: CachedResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.into_response(), Some(response));
    }

    #[test]
    fn test_rule_matching_respects_auth_and_method() {
        let mut rule = CacheRule::get("/models/**");
        let compiled = CompiledRule::compile(&rule).unwrap();
        assert!(compiled.matches(&Method::GET, "/models/a/b", false));
        assert!(!compiled.matches(&Method::POST, "/models/a", false));
        assert!(!compiled.matches(&Method::GET, "/models/a", true));

        rule.cache_authenticated = true;
        let compiled = CompiledRule::compile(&rule).unwrap();
        assert!(compiled.matches(&Method::GET, "/models/a", true));
    }
}
