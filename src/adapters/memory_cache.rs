use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use scc::HashMap;

use crate::{
    ports::{RemoteCache, RemoteCacheError, RemoteCacheResult},
    utils::pattern::key_glob,
};

/// In-process stand-in for a shared cache tier.
///
/// Useful for single-node deployments and tests. Key enumeration can be turned
/// off to behave like a backend without scan support, and the backend can be
/// marked unreachable to exercise degraded operation.
pub struct InMemoryRemoteCache {
    entries: HashMap<String, (Vec<u8>, Instant)>,
    scan_enabled: bool,
    unreachable: AtomicBool,
}

impl Default for InMemoryRemoteCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemoteCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            scan_enabled: true,
            unreachable: AtomicBool::new(false),
        }
    }

    /// A backend that cannot enumerate keys.
    pub fn without_scan() -> Self {
        Self {
            scan_enabled: false,
            ..Self::new()
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw stored payload, bypassing expiry.
    pub async fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .get_async(key)
            .await
            .map(|entry| entry.get().0.clone())
    }

    fn check_reachable(&self) -> RemoteCacheResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(RemoteCacheError::Unreachable(
                "in-memory backend marked unreachable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteCache for InMemoryRemoteCache {
    async fn get(&self, key: &str) -> RemoteCacheResult<Option<Vec<u8>>> {
        Ok(self.get_with_ttl(key).await?.map(|(value, _)| value))
    }

    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> RemoteCacheResult<Option<(Vec<u8>, Option<Duration>)>> {
        self.check_reachable()?;
        let now = Instant::now();
        let found = self
            .entries
            .get_async(key)
            .await
            .map(|entry| entry.get().clone());
        match found {
            Some((value, expires_at)) if expires_at > now => {
                Ok(Some((value, Some(expires_at - now))))
            }
            Some(_) => {
                self.entries.remove_async(key).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> RemoteCacheResult<()> {
        self.check_reachable()?;
        let expires_at = Instant::now() + ttl;
        self.entries.remove_async(key).await;
        let _ = self
            .entries
            .insert_async(key.to_string(), (value, expires_at))
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> RemoteCacheResult<bool> {
        self.check_reachable()?;
        Ok(self.entries.remove_async(key).await.is_some())
    }

    async fn scan(&self, pattern: &str) -> RemoteCacheResult<Vec<String>> {
        self.check_reachable()?;
        if !self.scan_enabled {
            return Err(RemoteCacheError::ScanUnsupported);
        }
        let matcher =
            key_glob(pattern).map_err(|e| RemoteCacheError::Operation(e.to_string()))?;
        let now = Instant::now();
        let mut keys = Vec::new();
        self.entries
            .retain_async(|key, (_, expires_at)| {
                if *expires_at > now && matcher.is_match(key) {
                    keys.push(key.clone());
                }
                true
            })
            .await;
        keys.sort();
        Ok(keys)
    }

    fn supports_scan(&self) -> bool {
        self.scan_enabled
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
