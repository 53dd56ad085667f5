use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use redis::{AsyncCommands, aio::ConnectionManager};

use crate::ports::{RemoteCache, RemoteCacheError, RemoteCacheResult};

/// Remote cache tier on Redis. Key enumeration uses `SCAN`, never `KEYS`.
#[derive(Clone)]
pub struct RedisRemoteCache {
    conn: ConnectionManager,
}

impl RedisRemoteCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).wrap_err_with(|| format!("Invalid Redis URL: {url}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .wrap_err("Failed to connect to Redis")?;
        tracing::info!("Connected remote cache tier to Redis");
        Ok(Self { conn })
    }
}

fn map_error(e: redis::RedisError) -> RemoteCacheError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        RemoteCacheError::Unreachable(e.to_string())
    } else {
        RemoteCacheError::Operation(e.to_string())
    }
}

#[async_trait]
impl RemoteCache for RedisRemoteCache {
    async fn get(&self, key: &str) -> RemoteCacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<Vec<u8>>>(key).await.map_err(map_error)
    }

    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> RemoteCacheResult<Option<(Vec<u8>, Option<Duration>)>> {
        let mut conn = self.conn.clone();
        let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_error)?;
        // PTTL is -1 for keys without expiry and -2 for missing keys
        let remaining = u64::try_from(pttl).ok().map(Duration::from_millis);
        Ok(value.map(|value| (value, remaining)))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> RemoteCacheResult<()> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_error)
    }

    async fn delete(&self, key: &str) -> RemoteCacheResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(map_error)?;
        Ok(removed > 0)
    }

    async fn scan(&self, pattern: &str) -> RemoteCacheResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(map_error)?;
            found.extend(keys);

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        tracing::debug!(pattern = %pattern, found = found.len(), "Redis scan");
        Ok(found)
    }

    fn supports_scan(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
