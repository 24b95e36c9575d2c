//! Event log
//!
//! One append-only stream per session (see SPEC_FULL.md §4.5). Workers
//! append events with [`EventLog::append`]; the SSE streamer joins the
//! session's consumer group, recovers any pending entries idle past
//! [`EventLog::claim_stale`], then reads new entries with
//! [`EventLog::read_new`], acknowledging and deduplicating as it goes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use super::store::{PendingEntry, StoreBackend, StoreError, StoreKey, StreamEntry};

#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A decoded event pulled off the stream, ready for SSE formatting.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub entry_id: String,
    pub event_id: String,
    pub event_type: String,
    /// Raw JSON payload, as appended.
    pub data: String,
    pub timestamp: f64,
}

impl LogEvent {
    fn from_entry(entry: StreamEntry) -> Self {
        let fields = entry.fields;
        Self::from_fields(entry.id, fields)
    }

    fn from_fields(entry_id: String, fields: HashMap<String, String>) -> Self {
        let event_id = fields
            .get("event_id")
            .cloned()
            .unwrap_or_else(|| entry_id.clone());
        let event_type = fields
            .get("type")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        let data = fields.get("data").cloned().unwrap_or_else(|| "{}".to_string());
        let timestamp = fields
            .get("timestamp")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        Self {
            entry_id,
            event_id,
            event_type,
            data,
            timestamp,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.event_type.as_str(), "final" | "error")
    }
}

pub struct EventLog {
    store: Arc<dyn StoreBackend>,
    session_ttl: Duration,
    maxlen: u64,
    block_ms: u64,
    max_pending_claim_age_ms: u64,
}

impl EventLog {
    pub fn new(
        store: Arc<dyn StoreBackend>,
        session_ttl: Duration,
        maxlen: u64,
        block_ms: u64,
        max_pending_claim_age_ms: u64,
    ) -> Self {
        Self {
            store,
            session_ttl,
            maxlen,
            block_ms,
            max_pending_claim_age_ms,
        }
    }

    /// Create a short-lived per-connection consumer identity within the
    /// session's consumer group.
    pub fn new_consumer_name() -> String {
        format!("consumer:{}", &Uuid::new_v4().simple().to_string()[..8])
    }

    /// Append an event, trimming the stream to `maxlen` approximately.
    /// Never blocks on consumer liveness.
    pub async fn append(
        &self,
        session_id: &str,
        event_type: &str,
        data: &str,
        event_id: Option<String>,
    ) -> Result<String, EventLogError> {
        let stream = StoreKey::stream(session_id);
        let fields = vec![
            ("type".to_string(), event_type.to_string()),
            (
                "event_id".to_string(),
                event_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
            ("data".to_string(), data.to_string()),
            (
                "timestamp".to_string(),
                Utc::now().timestamp_millis().to_string(),
            ),
        ];
        let entry_id = self.store.xadd(&stream, &fields, Some(self.maxlen)).await?;
        tracing::debug!(session_id, event_type, entry_id = %entry_id, "event appended");
        Ok(entry_id)
    }

    /// Create the consumer group at id `0` if it doesn't exist yet, and
    /// return a fresh consumer name for this connection.
    pub async fn ensure_group(&self, session_id: &str) -> Result<String, EventLogError> {
        let stream = StoreKey::stream(session_id);
        let group = StoreKey::consumer_group(session_id);
        self.store.xgroup_create(&stream, group).await?;
        Ok(Self::new_consumer_name())
    }

    /// Claim entries idle past `STREAM_MAX_PENDING_CLAIM_AGE_MS` for `consumer`.
    /// Used on connect to recover work abandoned by a dead consumer.
    pub async fn claim_stale(
        &self,
        session_id: &str,
        consumer: &str,
    ) -> Result<Vec<LogEvent>, EventLogError> {
        let stream = StoreKey::stream(session_id);
        let group = StoreKey::consumer_group(session_id);

        let pending: Vec<PendingEntry> = self
            .store
            .xpending_range(&stream, group, self.max_pending_claim_age_ms, 100)
            .await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = pending.into_iter().map(|p| p.id).collect();
        let claimed = self
            .store
            .xclaim(
                &stream,
                group,
                consumer,
                self.max_pending_claim_age_ms,
                &ids,
            )
            .await?;

        if !claimed.is_empty() {
            tracing::info!(session_id, claimed = claimed.len(), "claimed pending entries");
        }
        Ok(claimed.into_iter().map(LogEvent::from_entry).collect())
    }

    /// Read new entries (`>`), blocking up to `STREAM_BLOCK_TIMEOUT_MS`.
    /// An empty result means the read timed out and the caller should emit
    /// a heartbeat and try again.
    pub async fn read_new(
        &self,
        session_id: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEvent>, EventLogError> {
        let stream = StoreKey::stream(session_id);
        let group = StoreKey::consumer_group(session_id);
        let entries = self
            .store
            .xreadgroup(&stream, group, consumer, ">", count, self.block_ms)
            .await?;
        Ok(entries.into_iter().map(LogEvent::from_entry).collect())
    }

    pub async fn ack(&self, session_id: &str, entry_ids: &[String]) -> Result<(), EventLogError> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        let stream = StoreKey::stream(session_id);
        let group = StoreKey::consumer_group(session_id);
        self.store.xack(&stream, group, entry_ids).await?;
        Ok(())
    }

    /// Mark `event_id` delivered for this session. Returns `true` if this is
    /// the first time (caller should yield it), `false` if a duplicate.
    pub async fn mark_delivered(
        &self,
        session_id: &str,
        event_id: &str,
    ) -> Result<bool, EventLogError> {
        let key = StoreKey::delivered(session_id);
        let newly_added = self.store.sadd(&key, event_id, Some(self.session_ttl)).await?;
        Ok(newly_added)
    }

    /// Delete the stream and delivered-id set for a session.
    pub async fn cleanup(&self, session_id: &str) -> Result<(), EventLogError> {
        self.store.delete_stream(&StoreKey::stream(session_id)).await?;
        self.store.del(&StoreKey::delivered(session_id)).await?;
        tracing::info!(session_id, "event log cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::memory::InMemoryStore;

    fn event_log() -> EventLog {
        EventLog::new(
            Arc::new(InMemoryStore::new()),
            Duration::from_secs(3600),
            1000,
            50,
            30_000,
        )
    }

    #[tokio::test]
    async fn test_append_and_read_new() {
        let log = event_log();
        log.append("s1", "reasoning", "{\"text\":\"hi\"}", None)
            .await
            .unwrap();

        let consumer = log.ensure_group("s1").await.unwrap();
        let events = log.read_new("s1", &consumer, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "reasoning");
    }

    #[tokio::test]
    async fn test_ack_removes_from_pending() {
        let log = event_log();
        log.append("s1", "final", "{}", None).await.unwrap();
        let consumer = log.ensure_group("s1").await.unwrap();
        let events = log.read_new("s1", &consumer, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());

        log.ack("s1", &[events[0].entry_id.clone()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_dedup_via_mark_delivered() {
        let log = event_log();
        assert!(log.mark_delivered("s1", "evt-1").await.unwrap());
        assert!(!log.mark_delivered("s1", "evt-1").await.unwrap());
        assert!(log.mark_delivered("s1", "evt-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_stale_returns_empty_with_no_pending() {
        let log = event_log();
        log.ensure_group("s1").await.unwrap();
        let claimed = log.claim_stale("s1", "consumer:abc").await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_stream_and_delivered_set() {
        let log = event_log();
        log.append("s1", "final", "{}", None).await.unwrap();
        log.mark_delivered("s1", "evt-1").await.unwrap();
        log.cleanup("s1").await.unwrap();

        let consumer = log.ensure_group("s1").await.unwrap();
        let events = log.read_new("s1", &consumer, 10).await.unwrap();
        assert!(events.is_empty());
    }
}
