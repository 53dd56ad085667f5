use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use http::{HeaderValue, header};
use url::Url;

use crate::{
    config::PoolConfig,
    ports::{
        ClientFactory, DownstreamClient, DownstreamRequest, DownstreamResponse, HealthProbe,
        TransportError, TransportResult,
    },
};

const USER_AGENT: &str = concat!("sluice/", env!("CARGO_PKG_VERSION"));

/// Join an instance base URL and a request path (which may carry a query).
pub fn join_url(base_url: &str, path: &str) -> TransportResult<Url> {
    let base = base_url.trim_end_matches('/');
    let joined = if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    };
    Url::parse(&joined).map_err(|e| TransportError::InvalidRequest(format!("{joined}: {e}")))
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else {
        TransportError::Connection(e.to_string())
    }
}

/// Downstream client backed by one pooled `reqwest::Client` per service.
///
/// Connection reuse, idle limits and keep-alive all live in the reqwest
/// connection pool; this adapter only buffers bodies and maps errors.
pub struct ReqwestDownstreamClient {
    service: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl ReqwestDownstreamClient {
    pub fn new(service: &str, limits: &PoolConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(limits.max_idle_connections)
            .pool_idle_timeout(limits.keep_alive())
            .tcp_keepalive(limits.keep_alive())
            .timeout(limits.request_timeout())
            .connect_timeout(limits.connect_timeout())
            .user_agent(USER_AGENT)
            .build()
            .wrap_err_with(|| format!("Failed to build HTTP client for service '{service}'"))?;

        tracing::debug!(
            service,
            max_idle = limits.max_idle_connections,
            keep_alive_secs = limits.keep_alive_secs,
            "Created pooled HTTP client"
        );

        Ok(Self {
            service: service.to_string(),
            client,
            request_timeout: limits.request_timeout(),
        })
    }
}

#[async_trait]
impl DownstreamClient for ReqwestDownstreamClient {
    async fn send(
        &self,
        base_url: &str,
        request: &DownstreamRequest,
    ) -> TransportResult<DownstreamResponse> {
        let url = join_url(base_url, &request.path)?;

        let mut headers = request.headers.clone();
        headers.remove(header::HOST);
        if !headers.contains_key(header::ACCEPT) {
            headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        }

        tracing::debug!(
            service = %self.service,
            method = %request.method,
            url = %url,
            "Sending downstream request"
        );

        let response = self
            .client
            .request(request.method.clone(), url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.request_timeout))?;

        let status = response.status();
        let mut response_headers = response.headers().clone();
        response_headers.remove(header::TRANSFER_ENCODING);
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(e, self.request_timeout))?;

        Ok(DownstreamResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

/// Builds a [`ReqwestDownstreamClient`] per service.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReqwestClientFactory;

impl ClientFactory for ReqwestClientFactory {
    fn build(&self, service: &str, limits: &PoolConfig) -> Result<Arc<dyn DownstreamClient>> {
        Ok(Arc::new(ReqwestDownstreamClient::new(service, limits)?))
    }
}

/// Health probe issuing `GET` against an instance's liveness endpoint.
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(2)
            .build()
            .wrap_err("Failed to build health probe client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> TransportResult<bool> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        let healthy = response.status().is_success();
        // Drain so the connection can be reused
        let _ = response.bytes().await;
        tracing::trace!(url, healthy, "Health probe finished");
        Ok(healthy)
    }
}
