use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a shared remote cache backend.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RemoteCacheError {
    #[error("Remote cache unreachable: {0}")]
    Unreachable(String),

    #[error("Remote cache operation failed: {0}")]
    Operation(String),

    /// Key enumeration was requested from a backend that cannot do it
    #[error("Remote cache does not support key scans")]
    ScanUnsupported,
}

pub type RemoteCacheResult<T> = Result<T, RemoteCacheError>;

/// Byte-oriented shared cache tier (e.g. Redis) used behind the in-process tier.
///
/// Keys and values are opaque to the backend; the wire format of values is
/// owned by the cache layer's codec.
#[async_trait]
pub trait RemoteCache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> RemoteCacheResult<Option<Vec<u8>>>;

    /// Value together with its remaining lifetime. Backends that cannot report
    /// the lifetime return `None` for it.
    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> RemoteCacheResult<Option<(Vec<u8>, Option<Duration>)>> {
        Ok(self.get(key).await?.map(|value| (value, None)))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> RemoteCacheResult<()>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> RemoteCacheResult<bool>;

    /// Enumerate keys matching a glob. Only called when [`RemoteCache::supports_scan`]
    /// is true; the default reports the capability as missing.
    async fn scan(&self, _pattern: &str) -> RemoteCacheResult<Vec<String>> {
        Err(RemoteCacheError::ScanUnsupported)
    }

    /// Capability flag for pattern-based invalidation
    fn supports_scan(&self) -> bool {
        false
    }

    /// Short backend label for logs and metrics
    fn name(&self) -> &'static str;
}
