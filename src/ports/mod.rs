pub mod downstream;
pub mod metrics_sink;
pub mod remote_cache;

pub use downstream::{
    ClientFactory, DownstreamClient, DownstreamRequest, DownstreamResponse, HealthProbe,
    TransportError, TransportResult,
};
pub use metrics_sink::{CacheTier, MetricsSink, NoopMetrics, RequestOutcome};
pub use remote_cache::{RemoteCache, RemoteCacheError, RemoteCacheResult};
