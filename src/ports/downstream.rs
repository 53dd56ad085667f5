use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

use crate::config::PoolConfig;

/// Transport-level failures reported by a downstream client or health probe.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// Error when the request did not complete within its deadline
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    /// Error when connection to the instance fails
    #[error("Connection error: {0}")]
    Connection(String),

    /// Error when the request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for downstream transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// An outbound call, independent of the instance it will be sent to.
#[derive(Debug, Clone)]
pub struct DownstreamRequest {
    pub method: Method,
    /// Path and query, joined onto the selected instance's base URL
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl DownstreamRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let mut request = Self::new(Method::POST, path);
        request.body = body.into();
        request
    }
}

/// A fully buffered downstream response.
#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl DownstreamResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// DownstreamClient defines the port (interface) for sending calls to one service
#[async_trait]
pub trait DownstreamClient: Send + Sync + 'static {
    /// Send a request to the instance at `base_url`
    ///
    /// # Returns
    /// The buffered response for any status code, or a transport error when
    /// no response was received
    async fn send(
        &self,
        base_url: &str,
        request: &DownstreamRequest,
    ) -> TransportResult<DownstreamResponse>;
}

/// Builds the pooled client for a service from its connection limits.
pub trait ClientFactory: Send + Sync + 'static {
    fn build(&self, service: &str, limits: &PoolConfig) -> eyre::Result<Arc<dyn DownstreamClient>>;
}

/// Liveness probe against an instance's health endpoint.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    /// Probe `url`; `Ok(true)` only for a success status received within `timeout`
    async fn probe(&self, url: &str, timeout: Duration) -> TransportResult<bool>;
}
