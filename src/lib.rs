//! Sluice - the traffic-resilience layer of an API gateway.
//!
//! Sluice sits between request handlers and the downstream services they call.
//! Every outbound call goes through one [`Dispatcher`](core::Dispatcher), which
//! consults a tiered cache, picks the best healthy instance, leases a pooled
//! client and invokes it under an adaptive circuit breaker. The crate follows a
//! **hexagonal architecture**: business logic lives in `core`, collaborators are
//! traits in `ports`, and `adapters` holds the reqwest, Redis and `metrics`
//! implementations.
//!
//! # Features
//! - Adaptive circuit breaking with weighted failure categories, failure-rate and
//!   p95 trips, exponential recovery and a bounded half-open probe quota
//! - Service registry with hysteresis on health changes and score-based selection
//! - Per-service pooled clients with connection limits, EMA latency statistics,
//!   periodic maintenance and a stale-pool sweep
//! - Two-tier cache (in-process LRU + optional shared remote tier) with
//!   compression, tag and pattern invalidation and adaptive TTLs
//! - Structured tracing via `tracing` and metrics via the `metrics` facade
//!
//! # Quick Example
//! ```no_run
//! use sluice::{TrafficCore, TrafficPorts, config::load_config, ports::DownstreamRequest};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("sluice.toml").await?;
//! let core = TrafficCore::new(config, TrafficPorts::http()?).await?;
//! core.start();
//!
//! let response = core.dispatch("generation", DownstreamRequest::get("/models")).await?;
//! println!("{}", response.status);
//!
//! core.stop().await;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Startup paths return `eyre::Result<T>` with `WrapErr` context. Runtime paths
//! return typed `thiserror` errors; [`DispatchError`](core::DispatchError)
//! keeps "circuit open", "no instance", "pool exhausted" and "downstream
//! failed" distinct so callers can answer upstream appropriately.
//!
//! # Concurrency & Data Structures
//! Keyed registries (breakers, pools, services, endpoint statistics) use
//! `scc::HashMap`; per-entry mutable state sits behind `parking_lot` locks that
//! are never held across an await point.
//!
//! # Feature Flags
//! - `redis` (default): the Redis-backed remote cache tier.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    core::{DispatchError, Dispatcher, TrafficCore, TrafficPorts},
    ports::{DownstreamRequest, DownstreamResponse},
};
