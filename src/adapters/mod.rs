pub mod health_checker;
pub mod http_client;
pub mod memory_cache;
#[cfg(feature = "redis")]
pub mod redis_cache;

/// Re-export commonly used types from adapters
pub use health_checker::{HealthChecker, ProbeReport};
pub use http_client::{HttpHealthProbe, ReqwestClientFactory, ReqwestDownstreamClient};
pub use memory_cache::InMemoryRemoteCache;
#[cfg(feature = "redis")]
pub use redis_cache::RedisRemoteCache;
