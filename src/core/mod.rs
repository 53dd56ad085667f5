pub mod cache;
pub mod circuit_breaker;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod registry;

pub use cache::{CacheLayer, CacheStats, PatternInvalidation};
pub use circuit_breaker::{
    BreakerObserver, CircuitBreaker, CircuitBreakers, CircuitState, FailureKind, StateChange,
};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, ResponseClass};
pub use gateway::{TrafficCore, TrafficPorts};
pub use pool::{ConnectionPoolManager, PoolError, PoolStats};
pub use registry::{ProbeOutcome, ServiceInstance, ServiceRegistry};
