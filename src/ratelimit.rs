//! Sliding-Window Rate Limiter — cross-replica via the shared cache
//!
//! Per-client sorted set keyed by `(limiter_name, client_ip)`. The
//! check-and-record runs as a single atomic Lua script: evict expired
//! entries, count the remainder, and insert only when under the limit.
//! Two failure modes of a client-side pipeline are eliminated this way:
//! concurrent requests at the boundary reading the count before either
//! insert lands, and rejected requests polluting the window.
//!
//! If the shared cache is unreachable, the limiter degrades to an
//! in-process token bucket per client — each replica then enforces its own
//! budget, which is degraded but not broken.

use crate::cache::SharedCache;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// Atomic sliding-window check-and-record.
///
/// KEYS[1] = sorted-set key, e.g. "ratelimit:llm:10.1.2.3"
/// ARGV[1] = now (float seconds, used as the score)
/// ARGV[2] = window start (eviction cutoff)
/// ARGV[3] = max requests
/// ARGV[4] = window seconds (key TTL)
/// ARGV[5] = unique member id
///
/// Score and member are intentionally separate: the score is the timestamp
/// used for range eviction; the member is a UUID so two requests landing in
/// the same clock tick are both recorded.
///
/// Returns 1 = allowed, 0 = limit exceeded.
const SLIDING_WINDOW_LUA: &str = r#"
local key          = KEYS[1]
local now          = ARGV[1]
local window_start = ARGV[2]
local max_requests = tonumber(ARGV[3])
local window_ttl   = tonumber(ARGV[4])
local unique_id    = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, 0, window_start)

local count = redis.call('ZCARD', key)

if count < max_requests then
    redis.call('ZADD', key, now, unique_id)
    redis.call('EXPIRE', key, window_ttl)
    return 1
else
    return 0
end
"#;

/// Limiter decision, carrying the retry-after hint for denials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Denied { retry_after_seconds: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

// ─── Fallback token bucket ────────────────────────────────────────────────────

/// In-process token bucket, used only while the shared cache is down.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    refill_rate: f64,
}

impl TokenBucket {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    fn consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ─── Rate limiter ─────────────────────────────────────────────────────────────

/// Per-client sliding-window rate limiter backed by the shared cache.
pub struct RateLimiter {
    name: String,
    max_requests: u64,
    window_seconds: u64,
    cache: Option<SharedCache>,
    script: redis::Script,
    fallback_buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    /// `cache = None` runs permanently on the in-process fallback (used in
    /// tests and cache-less deployments).
    pub fn new(
        name: &str,
        max_requests: u64,
        window_seconds: u64,
        cache: Option<SharedCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            max_requests,
            window_seconds,
            cache,
            script: redis::Script::new(SLIDING_WINDOW_LUA),
            fallback_buckets: DashMap::new(),
        })
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Check-and-record one request for a client.
    pub async fn check(&self, client_ip: &str) -> RateLimitDecision {
        let allowed = match &self.cache {
            Some(cache) => match self.check_shared(cache, client_ip).await {
                Ok(allowed) => allowed,
                Err(e) => {
                    warn!(
                        limiter = %self.name,
                        error = %e,
                        "shared cache unavailable, falling back to in-memory limiter"
                    );
                    self.check_fallback(client_ip)
                }
            },
            None => self.check_fallback(client_ip),
        };

        if allowed {
            RateLimitDecision::Allowed
        } else {
            warn!(limiter = %self.name, client = client_ip, "rate limit exceeded");
            RateLimitDecision::Denied {
                retry_after_seconds: self.window_seconds,
            }
        }
    }

    async fn check_shared(
        &self,
        cache: &SharedCache,
        client_ip: &str,
    ) -> Result<bool, crate::cache::CacheError> {
        let key = format!("ratelimit:{}:{}", self.name, client_ip);
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let window_start = now - self.window_seconds as f64;

        let args = [
            now.to_string(),
            window_start.to_string(),
            self.max_requests.to_string(),
            self.window_seconds.to_string(),
            Uuid::new_v4().to_string(),
        ];

        let result = cache.eval_script(&self.script, &key, &args).await?;
        Ok(result == 1)
    }

    fn check_fallback(&self, client_ip: &str) -> bool {
        let mut bucket = self.fallback_buckets.entry(client_ip.to_string()).or_insert_with(|| {
            TokenBucket::new(
                self.max_requests as f64,
                self.max_requests as f64 / self.window_seconds as f64,
            )
        });
        bucket.consume()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("max_requests", &self.max_requests)
            .field("window_seconds", &self.window_seconds)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fallback_enforces_limit_per_client() {
        // No shared cache configured: limiter runs on the token bucket.
        let limiter = RateLimiter::new("llm", 5, 60, None);

        let mut allowed = 0;
        let mut denied = 0;
        for _ in 0..10 {
            match limiter.check("203.0.113.7").await {
                RateLimitDecision::Allowed => allowed += 1,
                RateLimitDecision::Denied { retry_after_seconds } => {
                    assert_eq!(retry_after_seconds, 60);
                    denied += 1;
                }
            }
        }
        assert_eq!(allowed, 5);
        assert_eq!(denied, 5);
    }

    #[tokio::test]
    async fn fallback_buckets_are_independent_per_client() {
        let limiter = RateLimiter::new("write", 2, 60, None);

        assert!(limiter.check("10.0.0.1").await.is_allowed());
        assert!(limiter.check("10.0.0.1").await.is_allowed());
        assert!(!limiter.check("10.0.0.1").await.is_allowed());
        // A different client still has a full bucket
        assert!(limiter.check("10.0.0.2").await.is_allowed());
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1.0, 1000.0);
        assert!(bucket.consume());
        assert!(!bucket.consume());
        std::thread::sleep(std::time::Duration::from_millis(5));
        // 5ms at 1000 tokens/sec refills well past one token
        assert!(bucket.consume());
    }
}
