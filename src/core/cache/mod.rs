//! Two-tier response cache.
//!
//! Reads try the in-process LRU tier, then the optional shared remote tier;
//! remote hits are copied back into the fast tier. Writes go to both tiers.
//! The remote tier is never required: any failure there is logged, counted and
//! treated as a miss.
pub mod adaptive;
pub mod codec;
pub mod tier;

use std::{
    collections::HashSet,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

pub use adaptive::AdaptiveTtl;
pub use codec::{CodecError, storage_key};
pub use tier::LocalTier;

use crate::{
    config::CacheConfig,
    ports::{CacheTier, MetricsSink, RemoteCache, RemoteCacheError},
    utils::{background::BackgroundLoop, pattern::key_glob},
};

/// Remote key holding the JSON list of keys carrying a tag.
pub fn tag_index_key(tag: &str) -> String {
    format!("__tag__:{tag}")
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CacheError {
    #[error(transparent)]
    Remote(#[from] RemoteCacheError),

    #[error("Remote cache call timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Cache value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid key pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub local_hits: u64,
    pub remote_hits: u64,
    pub evictions: u64,
    pub remote_errors: u64,
    pub local_items: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Result of a glob invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PatternInvalidation {
    pub local_removed: usize,
    /// `None` when there is no remote tier or it cannot enumerate keys, in
    /// which case remote entries are left to expire on their own
    pub remote_removed: Option<usize>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    evictions: AtomicU64,
    remote_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct CacheLayer {
    config: CacheConfig,
    local: LocalTier,
    remote: Option<Arc<dyn RemoteCache>>,
    adaptive: AdaptiveTtl,
    metrics: Arc<dyn MetricsSink>,
    counters: Counters,
    loops: Mutex<Vec<BackgroundLoop>>,
}

impl CacheLayer {
    pub fn new(
        config: CacheConfig,
        remote: Option<Arc<dyn RemoteCache>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            local: LocalTier::new(config.local_max_items),
            adaptive: AdaptiveTtl::new(config.adaptive_ttl.clone(), config.default_ttl()),
            config,
            remote,
            metrics,
            counters: Counters::default(),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn adaptive(&self) -> &AdaptiveTtl {
        &self.adaptive
    }

    /// Whether pattern invalidation can reach the remote tier.
    pub fn remote_supports_scan(&self) -> bool {
        self.remote.as_ref().is_some_and(|r| r.supports_scan())
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if !self.config.enabled {
            return None;
        }
        let key = storage_key(key);

        if let Some(value) = self.local.get(&key, Instant::now()) {
            bump(&self.counters.hits);
            bump(&self.counters.local_hits);
            self.metrics.cache_access(CacheTier::Local, true);
            return Some(value);
        }
        self.metrics.cache_access(CacheTier::Local, false);

        if let Some(remote) = &self.remote {
            if let Some(found) = self.remote_call("get", remote.get_with_ttl(&key)).await {
                self.metrics.cache_access(CacheTier::Remote, found.is_some());
                if let Some((payload, remaining)) = found {
                    match codec::decode(&payload) {
                        Ok(value) => {
                            bump(&self.counters.hits);
                            bump(&self.counters.remote_hits);
                            // The fast-tier copy never outlives the remote entry
                            let ttl = remaining.map_or(self.config.backfill_ttl(), |left| {
                                left.min(self.config.backfill_ttl())
                            });
                            if !ttl.is_zero() {
                                self.store_local(key.into_owned(), value.clone(), ttl, Vec::new());
                            }
                            return Some(value);
                        }
                        Err(e) => {
                            bump(&self.counters.remote_errors);
                            tracing::warn!(key = %key, "Undecodable remote cache payload: {}", e);
                        }
                    }
                }
            }
        }

        bump(&self.counters.misses);
        None
    }

    /// Store `value` in both tiers. `ttl` defaults to the configured default.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>, tags: &[&str]) {
        if !self.config.enabled {
            return;
        }
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        let key = storage_key(key).into_owned();
        let owned_tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();

        bump(&self.counters.sets);

        let Some(remote) = &self.remote else {
            self.store_local(key, value, ttl, owned_tags);
            return;
        };

        let payload = match codec::encode(&value, self.config.compression_threshold_bytes) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::warn!(key = %key, "Failed to encode cache payload: {}", e);
                None
            }
        };
        self.store_local(key.clone(), value, ttl, owned_tags);

        if let Some(payload) = payload {
            self.remote_call("set", remote.set(&key, payload, ttl)).await;
            for tag in tags {
                self.index_tag(remote.as_ref(), tag, &key, ttl).await;
            }
        }
    }

    /// Remove `key` from both tiers; true if either tier held it.
    pub async fn delete(&self, key: &str) -> bool {
        let key = storage_key(key);
        let mut removed = self.local.remove(&key);
        if let Some(remote) = &self.remote {
            removed |= self
                .remote_call("delete", remote.delete(&key))
                .await
                .unwrap_or(false);
        }
        if removed {
            bump(&self.counters.deletes);
        }
        removed
    }

    /// Remove every entry carrying any of `tags`. Returns the number of distinct
    /// keys removed across both tiers.
    pub async fn invalidate_by_tag(&self, tags: &[&str]) -> usize {
        let mut removed: HashSet<String> =
            self.local.remove_tagged(tags).into_iter().collect();

        if let Some(remote) = &self.remote {
            for tag in tags {
                let index_key = tag_index_key(tag);
                let Some(keys) = self.read_tag_index(remote.as_ref(), &index_key).await else {
                    continue;
                };
                for key in keys {
                    let local = self.local.remove(&key);
                    let remote_deleted = self
                        .remote_call("delete", remote.delete(&key))
                        .await
                        .unwrap_or(false);
                    if local || remote_deleted {
                        removed.insert(key);
                    }
                }
                self.remote_call("delete", remote.delete(&index_key)).await;
            }
        }

        self.counters
            .deletes
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        tracing::debug!(tags = ?tags, removed = removed.len(), "Invalidated cache tags");
        removed.len()
    }

    /// Remove keys matching a glob (`*`, `?`). The fast tier is always swept; the
    /// remote tier only when its backend can enumerate keys. Hashed long keys
    /// are matched in their stored (hashed) form.
    pub async fn invalidate_pattern(
        &self,
        pattern: &str,
    ) -> Result<PatternInvalidation, CacheError> {
        let matcher = key_glob(pattern)?;
        let local_removed = self.local.remove_matching(&matcher);

        let remote_removed = match &self.remote {
            Some(remote) if remote.supports_scan() => {
                let keys = self
                    .remote_call("scan", remote.scan(pattern))
                    .await
                    .unwrap_or_default();
                let mut count = 0;
                for key in keys {
                    if self
                        .remote_call("delete", remote.delete(&key))
                        .await
                        .unwrap_or(false)
                    {
                        count += 1;
                    }
                }
                Some(count)
            }
            Some(remote) => {
                tracing::info!(
                    backend = remote.name(),
                    pattern,
                    "Remote cache cannot enumerate keys; remote entries left to expire"
                );
                None
            }
            None => None,
        };

        let total = local_removed + remote_removed.unwrap_or(0);
        self.counters
            .deletes
            .fetch_add(total as u64, Ordering::Relaxed);
        Ok(PatternInvalidation {
            local_removed,
            remote_removed,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, "Cached value does not match the requested type: {}", e);
                None
            }
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, ttl, tags).await;
        Ok(())
    }

    /// Drop expired entries from the fast tier.
    pub fn sweep(&self) -> usize {
        let removed = self.local.sweep(Instant::now());
        if removed > 0 {
            tracing::debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            sets: c.sets.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            local_hits: c.local_hits.load(Ordering::Relaxed),
            remote_hits: c.remote_hits.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            remote_errors: c.remote_errors.load(Ordering::Relaxed),
            local_items: self.local.len(),
        }
    }

    /// Launch the expiry sweep and, when enabled, adaptive-TTL recomputation.
    pub fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock();
        if !loops.is_empty() || !self.config.enabled {
            return;
        }

        let cache = self.clone();
        loops.push(BackgroundLoop::spawn(
            "cache-sweep",
            Duration::from_secs(self.config.sweep_interval_secs),
            move || {
                let cache = cache.clone();
                async move {
                    cache.sweep();
                }
            },
        ));

        if self.adaptive.is_enabled() {
            let cache = self.clone();
            loops.push(BackgroundLoop::spawn(
                "adaptive-ttl",
                Duration::from_secs(self.config.adaptive_ttl.recompute_interval_secs),
                move || {
                    let cache = cache.clone();
                    async move {
                        cache.adaptive.recompute().await;
                    }
                },
            ));
        }
    }

    pub async fn stop(&self) {
        let loops: Vec<BackgroundLoop> = self.loops.lock().drain(..).collect();
        for background in loops {
            background.stop().await;
        }
    }

    fn store_local(&self, key: String, value: Vec<u8>, ttl: Duration, tags: Vec<String>) {
        if self.local.set(key, value, ttl, tags, Instant::now()) {
            bump(&self.counters.evictions);
        }
    }

    async fn index_tag(&self, remote: &dyn RemoteCache, tag: &str, key: &str, ttl: Duration) {
        let index_key = tag_index_key(tag);
        let mut keys = self
            .read_tag_index(remote, &index_key)
            .await
            .unwrap_or_default();
        if keys.iter().any(|k| k == key) {
            return;
        }
        keys.push(key.to_string());

        match serde_json::to_vec(&keys) {
            Ok(encoded) => {
                let index_ttl = ttl.max(self.config.default_ttl());
                self.remote_call("set", remote.set(&index_key, encoded, index_ttl))
                    .await;
            }
            Err(e) => tracing::warn!(tag, "Failed to encode tag index: {}", e),
        }
    }

    async fn read_tag_index(
        &self,
        remote: &dyn RemoteCache,
        index_key: &str,
    ) -> Option<Vec<String>> {
        let raw = self.remote_call("get", remote.get(index_key)).await??;
        match serde_json::from_slice(&raw) {
            Ok(keys) => Some(keys),
            Err(e) => {
                bump(&self.counters.remote_errors);
                tracing::warn!(index_key, "Corrupt tag index: {}", e);
                None
            }
        }
    }

    /// Run a remote-tier call under the configured timeout. Failures degrade to
    /// `None` after being logged and counted.
    async fn remote_call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, RemoteCacheError>>,
    ) -> Option<T> {
        let timeout = self.config.remote_timeout();
        let error = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(e)) => CacheError::Remote(e),
            Err(_) => CacheError::Timeout(timeout),
        };
        bump(&self.counters.remote_errors);
        tracing::warn!(
            operation,
            "Remote cache unavailable, continuing with local tier: {}",
            error
        );
        None
    }
}
