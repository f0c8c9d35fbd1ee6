//! Rate Limiter Degradation Tests
//!
//! With the shared cache absent, the limiter must degrade to the
//! in-process token bucket: each client gets exactly its budget over the
//! window, denials carry the retry-after hint, and the API keeps serving.

use aegis::ratelimit::{RateLimitDecision, RateLimiter};

#[tokio::test]
async fn fallback_allows_exactly_the_budget() {
    // (max=5, window=60s), no shared cache: 10 requests from one client
    let limiter = RateLimiter::new("llm", 5, 60, None);

    let mut allowed = 0;
    let mut denied = 0;
    for _ in 0..10 {
        match limiter.check("198.51.100.9").await {
            RateLimitDecision::Allowed => allowed += 1,
            RateLimitDecision::Denied {
                retry_after_seconds,
            } => {
                assert_eq!(retry_after_seconds, 60);
                denied += 1;
            }
        }
    }

    assert_eq!(allowed, 5);
    assert_eq!(denied, 5);
}

#[tokio::test]
async fn denials_do_not_consume_budget_later() {
    let limiter = RateLimiter::new("write", 3, 60, None);
    let client = "203.0.113.4";

    for _ in 0..3 {
        assert!(limiter.check(client).await.is_allowed());
    }
    // Hammering past the limit must not extend the denial window: the
    // bucket refills from elapsed time, not from denied attempts.
    for _ in 0..20 {
        assert!(!limiter.check(client).await.is_allowed());
    }
}

#[tokio::test]
async fn clients_are_isolated() {
    let limiter = RateLimiter::new("llm", 1, 60, None);
    assert!(limiter.check("10.0.0.1").await.is_allowed());
    assert!(!limiter.check("10.0.0.1").await.is_allowed());
    // A different client IP has an untouched budget
    assert!(limiter.check("10.0.0.2").await.is_allowed());
}
