use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::core::circuit_breaker::FailureKind;

/// How a caller should present a dispatch failure upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// The service cannot be called right now; do not retry immediately
    Unavailable,
    /// Local capacity is exhausted; try again shortly
    Backpressure,
    /// The service answered with a failure or could not be reached
    Downstream,
    /// This process is shutting down
    ShuttingDown,
}

impl ResponseClass {
    /// Conventional HTTP status for this class
    pub fn status_code(self) -> StatusCode {
        match self {
            ResponseClass::Unavailable | ResponseClass::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ResponseClass::Backpressure => StatusCode::TOO_MANY_REQUESTS,
            ResponseClass::Downstream => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Errors surfaced by [`crate::core::Dispatcher::dispatch`], always annotated
/// with the service they concern.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("Circuit for service '{service}' is open, retry after {retry_after:?}")]
    CircuitOpen {
        service: String,
        retry_after: Duration,
    },

    #[error("No healthy instance available for service '{service}'")]
    NoHealthyInstance { service: String },

    #[error("Connection pool for service '{service}' is exhausted ({limit} connections)")]
    PoolExhausted { service: String, limit: usize },

    #[error("Downstream call to service '{service}' failed ({kind}): {message}")]
    Downstream {
        service: String,
        /// Status code when the service answered
        status: Option<StatusCode>,
        kind: FailureKind,
        message: String,
    },

    #[error("Refusing call to service '{service}': shutting down")]
    ShuttingDown { service: String },
}

impl DispatchError {
    pub fn response_class(&self) -> ResponseClass {
        match self {
            DispatchError::CircuitOpen { .. } | DispatchError::NoHealthyInstance { .. } => {
                ResponseClass::Unavailable
            }
            DispatchError::PoolExhausted { .. } => ResponseClass::Backpressure,
            DispatchError::Downstream { .. } => ResponseClass::Downstream,
            DispatchError::ShuttingDown { .. } => ResponseClass::ShuttingDown,
        }
    }

    pub fn service(&self) -> &str {
        match self {
            DispatchError::CircuitOpen { service, .. }
            | DispatchError::NoHealthyInstance { service }
            | DispatchError::PoolExhausted { service, .. }
            | DispatchError::Downstream { service, .. }
            | DispatchError::ShuttingDown { service } => service,
        }
    }

    /// Failure category for downstream errors
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            DispatchError::Downstream { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Retry hint for open circuits
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DispatchError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
