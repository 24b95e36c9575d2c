//! Worker event publisher
//!
//! Synchronous event appender used from worker dispatch tasks (see
//! SPEC_FULL.md §4.6). Workers run on a separate, CPU/IO-bound process pool
//! whose call stack is synchronous by contract, so this wraps its own
//! blocking `redis::Client` rather than the async store pool.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::Commands;
use redis::streams::StreamMaxlen;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::metrics::Metrics;

#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Optional metadata attached to every published event.
#[derive(Debug, Clone, Default)]
pub struct EventMetadata {
    pub user_id: Option<String>,
    pub task_id: Option<String>,
    pub source: String,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            user_id: None,
            task_id: None,
            source: source.into(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Publishes events to a session's stream and polls its cancellation flag.
///
/// One instance per worker thread; holds a single `redis::Client` handle
/// (connections are opened lazily and are cheap, so no pooling here).
pub struct EventPublisher {
    client: redis::Client,
    maxlen: u64,
    metrics: Arc<Metrics>,
}

impl EventPublisher {
    pub fn new(redis_url: &str, maxlen: u64, metrics: Arc<Metrics>) -> Result<Self, PublisherError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            maxlen,
            metrics,
        })
    }

    fn stream_key(session_id: &str) -> String {
        format!("stream:{session_id}")
    }

    fn cancel_key(session_id: &str) -> String {
        format!("cancel:{session_id}")
    }

    pub fn publish(
        &self,
        session_id: &str,
        event_type: &str,
        data: &Value,
        metadata: Option<&EventMetadata>,
        event_id: Option<String>,
    ) -> Result<String, PublisherError> {
        let mut conn = self.client.get_connection()?;
        let evt_id = event_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        let mut fields: Vec<(String, String)> = vec![
            ("type".to_string(), event_type.to_string()),
            ("event_id".to_string(), evt_id.clone()),
            ("timestamp".to_string(), timestamp.to_string()),
            ("data".to_string(), serde_json::to_string(data)?),
        ];

        match metadata {
            Some(meta) => {
                if let Some(user_id) = &meta.user_id {
                    fields.push(("user_id".to_string(), user_id.clone()));
                }
                if let Some(task_id) = &meta.task_id {
                    fields.push(("task_id".to_string(), task_id.clone()));
                }
                fields.push(("source".to_string(), meta.source.clone()));
            }
            None => fields.push(("source".to_string(), "worker".to_string())),
        }
        fields.push(("session_id".to_string(), session_id.to_string()));

        let entry_id: String = conn.xadd_maxlen(
            Self::stream_key(session_id),
            StreamMaxlen::Approx(self.maxlen),
            "*",
            &fields,
        )?;

        tracing::debug!(session_id, event_type, event_id = %evt_id, entry_id = %entry_id, "event published");
        self.metrics.record_event_published(event_type);
        Ok(entry_id)
    }

    pub fn publish_trace(
        &self,
        session_id: &str,
        thinking: &str,
        stage: Option<&str>,
        metadata: Option<&EventMetadata>,
    ) -> Result<String, PublisherError> {
        let data = serde_json::json!({ "thinking": thinking, "stage": stage });
        self.publish(session_id, "trace", &data, metadata, None)
    }

    pub fn publish_tool_call(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: &Value,
        call_id: Option<String>,
        metadata: Option<&EventMetadata>,
    ) -> Result<String, PublisherError> {
        let call_id = call_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let data = serde_json::json!({
            "tool_name": tool_name,
            "tool_input": tool_input,
            "call_id": call_id,
        });
        self.publish(session_id, "tool_call", &data, metadata, None)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn publish_tool_result(
        &self,
        session_id: &str,
        tool_name: &str,
        result: &Value,
        call_id: &str,
        success: bool,
        duration_ms: Option<f64>,
        metadata: Option<&EventMetadata>,
    ) -> Result<String, PublisherError> {
        let data = serde_json::json!({
            "tool_name": tool_name,
            "result": result,
            "call_id": call_id,
            "success": success,
            "duration_ms": duration_ms,
        });
        self.publish(session_id, "tool_result", &data, metadata, None)
    }

    pub fn publish_final(
        &self,
        session_id: &str,
        response: &str,
        total_duration_ms: Option<f64>,
        token_usage: Option<Value>,
        metadata: Option<&EventMetadata>,
    ) -> Result<String, PublisherError> {
        let data = serde_json::json!({
            "response": response,
            "complete": true,
            "total_duration_ms": total_duration_ms,
            "token_usage": token_usage,
        });
        self.publish(session_id, "final", &data, metadata, None)
    }

    pub fn publish_error(
        &self,
        session_id: &str,
        message: &str,
        error_type: &str,
        recoverable: bool,
        details: Option<Value>,
        metadata: Option<&EventMetadata>,
    ) -> Result<String, PublisherError> {
        let data = serde_json::json!({
            "message": message,
            "error_type": error_type,
            "recoverable": recoverable,
            "details": details,
        });
        self.publish(session_id, "error", &data, metadata, None)
    }

    /// Polled cooperatively between agent steps and tool calls.
    pub fn is_cancelled(&self, session_id: &str) -> Result<bool, PublisherError> {
        let mut conn = self.client.get_connection()?;
        let exists: bool = conn.exists(Self::cancel_key(session_id))?;
        Ok(exists)
    }

    pub fn set_cancel_flag(&self, session_id: &str, ttl: Duration) -> Result<(), PublisherError> {
        let mut conn = self.client.get_connection()?;
        let _: () = conn.set_ex(Self::cancel_key(session_id), "1", ttl.as_secs().max(1))?;
        tracing::info!(session_id, "cancel flag set");
        Ok(())
    }

    pub fn clear_cancel_flag(&self, session_id: &str) -> Result<(), PublisherError> {
        let mut conn = self.client.get_connection()?;
        let _: () = conn.del(Self::cancel_key(session_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_and_cancel_key() {
        assert_eq!(EventPublisher::stream_key("s1"), "stream:s1");
        assert_eq!(EventPublisher::cancel_key("s1"), "cancel:s1");
    }

    #[test]
    fn test_metadata_builder() {
        let meta = EventMetadata::new("celery_worker")
            .with_user("u1")
            .with_task("t1");
        assert_eq!(meta.source, "celery_worker");
        assert_eq!(meta.user_id.as_deref(), Some("u1"));
        assert_eq!(meta.task_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_metadata_default_has_no_user_or_task() {
        let meta = EventMetadata::new("worker");
        assert!(meta.user_id.is_none());
        assert!(meta.task_id.is_none());
    }
}
