//! Shared Cache — Redis-backed cross-replica state
//!
//! One connection manager per process, lazily reconnecting. Used by the
//! rate limiter (sorted-set Lua script), the anomaly-monitor dedup keys,
//! and the language-model response cache.
//!
//! Every operation can fail when the cache is unreachable; callers MUST
//! treat that as a degradation signal and fall back (in-memory map, token
//! bucket, cache-less model call) rather than failing the request.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unreachable: {0}")]
    Unreachable(#[from] redis::RedisError),
}

/// Process-wide shared cache handle. Cheap to clone.
#[derive(Clone)]
pub struct SharedCache {
    manager: ConnectionManager,
}

impl SharedCache {
    /// Connect to the shared cache. Connection failures at startup are
    /// surfaced — callers decide whether to run degraded without a handle.
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        info!("connected to shared cache");
        Ok(Self { manager })
    }

    /// Get a string value; `None` when the key is absent.
    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    /// Set a string value with a TTL in seconds.
    pub async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds).await?;
        Ok(())
    }

    /// Whether a key currently exists (TTL not expired).
    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        Ok(conn.exists(key).await?)
    }

    /// Delete a key; returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    /// Evaluate a server-side Lua script against one key.
    ///
    /// Script execution is a single atomic server-side step — no other
    /// client can interleave between the script's commands.
    pub async fn eval_script(
        &self,
        script: &redis::Script,
        key: &str,
        args: &[String],
    ) -> Result<i64, CacheError> {
        let mut conn = self.manager.clone();
        let mut invocation = script.key(key);
        for arg in args {
            invocation.arg(arg);
        }
        Ok(invocation.invoke_async(&mut conn).await?)
    }
}

impl std::fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCache").finish_non_exhaustive()
    }
}
