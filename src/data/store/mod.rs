//! Store module
//!
//! Provides the KV/hash/zset/set/stream abstraction the rest of the crate is
//! built on (see SPEC_FULL.md §4.1), with pluggable backends:
//! - In-memory (tests, local dev without Redis)
//! - Redis (production), via deadpool-redis
//!
//! Higher-level components (rate limiter, distributed lock, session store,
//! event log) are written against `Arc<dyn StoreBackend>` directly rather
//! than through a typed wrapper, since their operations map 1:1 onto the
//! trait's hash/zset/stream primitives.

mod backend;
mod error;
mod key;
pub mod memory;
pub mod rate_limiter;
mod redis;

use std::sync::Arc;

pub use backend::{PendingEntry, StoreBackend, StreamEntry};
pub use error::StoreError;
pub use key::StoreKey;
pub use rate_limiter::{RateLimitRule, RateLimitResult, RateLimiter};

use crate::core::config::StoreConfig;
use memory::InMemoryStore;
use redis::RedisStore;

/// Construct the store backend for a given pool size.
///
/// The SSE streamer's blocking `XREADGROUP` calls and the rest of the
/// application's command traffic must not share a connection pool — a
/// blocked read would starve ordinary commands. Callers that need both
/// construct two backends against the same `StoreConfig` with different
/// pool sizes (see `app.rs`).
pub async fn build_store_backend(
    config: &StoreConfig,
    pool_size: u32,
) -> Result<Arc<dyn StoreBackend>, StoreError> {
    if config.url.starts_with("memory://") {
        tracing::debug!("initializing in-memory store backend");
        return Ok(Arc::new(InMemoryStore::new()));
    }

    tracing::debug!(max_size = pool_size, "initializing redis store backend");
    let store = RedisStore::new(&config.url, pool_size as usize).await?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_memory_backend() {
        let config = StoreConfig {
            url: "memory://".to_string(),
            max_connections: 5,
            socket_timeout_secs: 5,
        };
        let backend = build_store_backend(&config, 5).await.unwrap();
        assert_eq!(backend.backend_name(), "memory");
        backend.health_check().await.unwrap();
    }
}
