//! Sliding-window rate limiter
//!
//! # Algorithm
//!
//! Each identifier+route pair owns a sorted set keyed by `StoreKey::rate_limit`.
//! Every check runs `StoreBackend::rate_limit_check` — a single atomic
//! server-side script (see SPEC_FULL.md §4.2) that, in one round trip:
//! 1. Drops entries with score <= now - window (`ZREMRANGEBYSCORE`)
//! 2. Counts the survivors (`ZCARD`)
//! 3. If under the limit, records this request (`ZADD` with score = now, a
//!    per-request unique member to avoid collisions) and refreshes the key's
//!    TTL to the window so idle identifiers don't linger forever
//! 4. Returns allowed/remaining/reset based on the count
//!
//! Unlike a fixed window, the count reflects exactly "requests in the last
//! `window_secs`", so there is no boundary-doubling artifact. Doing all four
//! steps in one script call (rather than as separate `zremrangebyscore` /
//! `zcard` / `zadd` round trips) closes the TOCTOU window where two
//! concurrent callers for the same identifier could both pass the count
//! check before either recorded its request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::StoreBackend;
use super::key::StoreKey;

/// Rate limit rule: N requests per `window_secs` for a given route.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub route: &'static str,
    pub limit: u32,
    pub window_secs: u64,
}

impl RateLimitRule {
    pub fn new(route: &'static str, limit: u32, window_secs: u64) -> Self {
        Self {
            route,
            limit,
            window_secs,
        }
    }
}

/// Rate limit check result
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    /// Unix timestamp when the oldest request in the window expires.
    pub reset_at: u64,
    pub retry_after: Option<u64>,
}

/// Sliding-window rate limiter backed by `StoreBackend`.
pub struct RateLimiter {
    store: Arc<dyn StoreBackend>,
    nonce: AtomicU64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn StoreBackend>) -> Self {
        Self {
            store,
            nonce: AtomicU64::new(0),
        }
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "system clock is before UNIX epoch");
                0
            })
    }

    /// Check and, if allowed, record the request. Fails open on store errors.
    pub async fn check(&self, rule: &RateLimitRule, identifier: &str) -> RateLimitResult {
        let key = StoreKey::rate_limit(identifier, rule.route);
        let now = Self::now_secs();
        let window = rule.window_secs;
        let cutoff = now.saturating_sub(window) as f64;
        let limit_i64 = i64::from(rule.limit);

        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let member = format!("{now}-{nonce}");

        let (allowed, count) = match self
            .store
            .rate_limit_check(&key, cutoff, limit_i64, now as f64, &member, Duration::from_secs(window))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(route = rule.route, %identifier, error = %e, "rate limit check failed, allowing request");
                return RateLimitResult {
                    allowed: true,
                    remaining: rule.limit,
                    limit: rule.limit,
                    reset_at: now + window,
                    retry_after: None,
                };
            }
        };

        let remaining = (limit_i64 - count - if allowed { 1 } else { 0 })
            .max(0)
            .try_into()
            .unwrap_or(0u32);
        let reset_at = now + window;

        tracing::trace!(
            route = rule.route,
            %identifier,
            count,
            limit = rule.limit,
            allowed,
            "rate limit check"
        );

        RateLimitResult {
            allowed,
            remaining,
            limit: rule.limit,
            reset_at,
            retry_after: if allowed { None } else { Some(window) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::memory::InMemoryStore;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn test_allows_under_limit() {
        let limiter = limiter();
        let rule = RateLimitRule::new("chat", 5, 60);
        for i in 0..5 {
            let result = limiter.check(&rule, "ip:1.2.3.4").await;
            assert!(result.allowed, "request {i} should be allowed");
        }
    }

    #[tokio::test]
    async fn test_blocks_over_limit() {
        let limiter = limiter();
        let rule = RateLimitRule::new("chat", 3, 60);
        for _ in 0..3 {
            assert!(limiter.check(&rule, "ip:1.2.3.4").await.allowed);
        }
        let result = limiter.check(&rule, "ip:1.2.3.4").await;
        assert!(!result.allowed);
        assert_eq!(result.retry_after, Some(60));
    }

    #[tokio::test]
    async fn test_separate_identifiers_tracked_independently() {
        let limiter = limiter();
        let rule = RateLimitRule::new("chat", 1, 60);
        assert!(limiter.check(&rule, "ip:1.2.3.4").await.allowed);
        assert!(!limiter.check(&rule, "ip:1.2.3.4").await.allowed);
        assert!(limiter.check(&rule, "ip:5.6.7.8").await.allowed);
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let limiter = limiter();
        let rule = RateLimitRule::new("chat", 10, 60);
        let r1 = limiter.check(&rule, "ip:1.2.3.4").await;
        assert_eq!(r1.remaining, 9);
        let r2 = limiter.check(&rule, "ip:1.2.3.4").await;
        assert_eq!(r2.remaining, 8);
    }

    #[tokio::test]
    async fn test_separate_routes_tracked_independently() {
        let limiter = limiter();
        let chat_rule = RateLimitRule::new("chat", 1, 60);
        let sync_rule = RateLimitRule::new("chat_sync", 1, 60);
        assert!(limiter.check(&chat_rule, "ip:1.2.3.4").await.allowed);
        assert!(limiter.check(&sync_rule, "ip:1.2.3.4").await.allowed);
    }
}
