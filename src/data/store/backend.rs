//! Store backend trait definition
//!
//! Defines the KV/stream/pub-sub surface the rest of the crate is built on
//! (see SPEC_FULL.md §4.1). Both the in-memory and Redis implementations
//! satisfy this trait; every higher-level component (rate limiter, lock,
//! session store, event log) is written against `StoreBackend` and never
//! against a concrete backend directly.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::error::StoreError;

/// A single entry read back from a stream (either via XREADGROUP or XCLAIM).
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Store-assigned entry id, e.g. `"1699999999999-0"`.
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// A pending (delivered, unacked) entry as reported by XPENDING.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
}

/// Store backend trait
///
/// # Consistency notes
///
/// Individual operations are atomic; return values from operations like
/// `del`/`exists` are best-effort under concurrent access, which is
/// acceptable given the session/event-log model only relies on
/// single-key atomicity (see SPEC_FULL.md §3 Invariants).
#[async_trait]
pub trait StoreBackend: Send + Sync {
    // ---------------------------------------------------------------
    // String KV
    // ---------------------------------------------------------------

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> Result<(), StoreError>;

    /// `SET key value NX EX ttl` — set only if absent. Used for lock acquire.
    async fn set_nx(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Atomic increment with TTL (creates key if absent, sets TTL only on creation).
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError>;

    // ---------------------------------------------------------------
    // Hash KV (session records)
    // ---------------------------------------------------------------

    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    // ---------------------------------------------------------------
    // Sorted set (sliding-window rate limit bucket)
    // ---------------------------------------------------------------

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<i64, StoreError>;

    async fn zcard(&self, key: &str) -> Result<i64, StoreError>;

    /// Atomic sliding-window admission check (see SPEC_FULL.md §4.2: "atomic
    /// server-side script per call"). In one round trip: drops members with
    /// score `<= cutoff`, counts the survivors, and — only if that count is
    /// `< limit` — adds `member` at `score` and refreshes the key's TTL to
    /// `ttl`. Returns `(admitted, count_before_admission)`.
    async fn rate_limit_check(
        &self,
        key: &str,
        cutoff: f64,
        limit: i64,
        score: f64,
        member: &str,
        ttl: Duration,
    ) -> Result<(bool, i64), StoreError>;

    // ---------------------------------------------------------------
    // Set (delivered-id dedup)
    // ---------------------------------------------------------------

    /// Returns `true` if the member was newly added, `false` if already present.
    async fn sadd(&self, key: &str, member: &str, ttl: Option<Duration>)
    -> Result<bool, StoreError>;

    // ---------------------------------------------------------------
    // Streams + consumer groups (event log)
    // ---------------------------------------------------------------

    async fn xadd(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: Option<u64>,
    ) -> Result<String, StoreError>;

    /// Create the consumer group at id `0`, ignoring a "group already exists" reply.
    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    async fn xack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), StoreError>;

    async fn xpending_range(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError>;

    async fn xclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Delete a stream key entirely (session cleanup).
    async fn delete_stream(&self, stream: &str) -> Result<(), StoreError>;

    // ---------------------------------------------------------------
    // Lua-equivalent atomic scripts (lock release/extend, sliding window)
    // ---------------------------------------------------------------

    /// Release the lock at `key` only if its current value equals `token`.
    /// Returns `true` if released.
    async fn release_if_owner(&self, key: &str, token: &str) -> Result<bool, StoreError>;

    /// Extend the TTL of the lock at `key` only if its current value equals `token`.
    async fn extend_if_owner(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;

    fn backend_name(&self) -> &'static str;
}
