//! Session store
//!
//! Session state lives in a Redis hash keyed by `StoreKey::session`, with its
//! TTL refreshed on every write so an idle session expires `SESSION_TTL_SECONDS`
//! after the last activity (see SPEC_FULL.md §4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use super::lock::DistributedLock;
use super::store::{StoreBackend, StoreError, StoreKey};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Session status as tracked through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Processing,
    Completed,
    Error,
    Cancelled,
    Timeout,
}

impl SessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "error" => Self::Error,
            "cancelled" => Self::Cancelled,
            "timeout" => Self::Timeout,
            _ => Self::Idle,
        }
    }
}

/// Session record, mirrored 1:1 onto a Redis hash.
#[derive(Debug, Clone)]
pub struct SessionData {
    pub status: SessionStatus,
    pub created_at: String,
    pub last_activity: String,
    pub prompt: String,
    pub user_id: Option<String>,
    pub task_id: Option<String>,
    pub message_count: u64,
    /// Opaque caller-supplied JSON, preserved verbatim.
    pub context: String,
}

impl SessionData {
    fn new(prompt: String, user_id: Option<String>, context: String) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            status: SessionStatus::Idle,
            created_at: now.clone(),
            last_activity: now,
            prompt,
            user_id,
            task_id: None,
            message_count: 0,
            context,
        }
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("status".to_string(), self.status.as_str().to_string()),
            ("created_at".to_string(), self.created_at.clone()),
            ("last_activity".to_string(), self.last_activity.clone()),
            ("prompt".to_string(), self.prompt.clone()),
            (
                "user_id".to_string(),
                self.user_id.clone().unwrap_or_default(),
            ),
            (
                "task_id".to_string(),
                self.task_id.clone().unwrap_or_default(),
            ),
            ("message_count".to_string(), self.message_count.to_string()),
            ("context".to_string(), self.context.clone()),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Self {
        Self {
            status: SessionStatus::parse(fields.get("status").map(String::as_str).unwrap_or("")),
            created_at: fields.get("created_at").cloned().unwrap_or_default(),
            last_activity: fields.get("last_activity").cloned().unwrap_or_default(),
            prompt: fields.get("prompt").cloned().unwrap_or_default(),
            user_id: fields
                .get("user_id")
                .filter(|s| !s.is_empty())
                .cloned(),
            task_id: fields
                .get("task_id")
                .filter(|s| !s.is_empty())
                .cloned(),
            message_count: fields
                .get("message_count")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            context: fields
                .get("context")
                .cloned()
                .unwrap_or_else(|| "{}".to_string()),
        }
    }
}

pub struct SessionStore {
    store: Arc<dyn StoreBackend>,
    ttl: Duration,
    lock_ttl: Duration,
}

impl SessionStore {
    pub fn new(store: Arc<dyn StoreBackend>, ttl: Duration, lock_ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            lock_ttl,
        }
    }

    pub async fn create(
        &self,
        session_id: &str,
        prompt: String,
        user_id: Option<String>,
        context: String,
    ) -> Result<SessionData, SessionError> {
        let key = StoreKey::session(session_id);
        let session = SessionData::new(prompt, user_id.clone(), context);
        self.store.hset_many(&key, &session.to_fields()).await?;
        self.store.expire(&key, self.ttl).await?;
        tracing::info!(session_id, ?user_id, "session created");
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionData>, SessionError> {
        let key = StoreKey::session(session_id);
        let fields = self.store.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(SessionData::from_fields(&fields)))
    }

    pub async fn exists(&self, session_id: &str) -> Result<bool, SessionError> {
        Ok(self.store.exists(&StoreKey::session(session_id)).await?)
    }

    async fn touch_ttl(&self, session_id: &str) -> Result<(), SessionError> {
        self.store
            .expire(&StoreKey::session(session_id), self.ttl)
            .await?;
        Ok(())
    }

    /// Merge arbitrary fields into the session hash, refreshing
    /// `last_activity` and the TTL. Lost-update races on individual fields
    /// are acceptable: the worker owns writes while `processing`.
    pub async fn update(
        &self,
        session_id: &str,
        fields: &[(String, String)],
    ) -> Result<(), SessionError> {
        let key = StoreKey::session(session_id);
        if !self.store.exists(&key).await? {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        let mut all = fields.to_vec();
        all.push(("last_activity".to_string(), Utc::now().to_rfc3339()));
        self.store.hset_many(&key, &all).await?;
        self.touch_ttl(session_id).await
    }

    pub async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), SessionError> {
        let key = StoreKey::session(session_id);
        if !self.store.exists(&key).await? {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        self.store
            .hset_many(
                &key,
                &[
                    ("status".to_string(), status.as_str().to_string()),
                    ("last_activity".to_string(), Utc::now().to_rfc3339()),
                ],
            )
            .await?;
        self.touch_ttl(session_id).await
    }

    pub async fn touch(&self, session_id: &str) -> Result<bool, SessionError> {
        let key = StoreKey::session(session_id);
        if !self.store.exists(&key).await? {
            return Ok(false);
        }
        self.store
            .hset_many(
                &key,
                &[("last_activity".to_string(), Utc::now().to_rfc3339())],
            )
            .await?;
        self.touch_ttl(session_id).await?;
        Ok(true)
    }

    pub async fn increment_message_count(&self, session_id: &str) -> Result<i64, SessionError> {
        let key = StoreKey::session(session_id);
        let count = self.store.hincrby(&key, "message_count", 1).await?;
        self.touch_ttl(session_id).await?;
        Ok(count)
    }

    pub async fn delete(&self, session_id: &str) -> Result<bool, SessionError> {
        let deleted = self.store.del(&StoreKey::session(session_id)).await?;
        if deleted {
            tracing::info!(session_id, "session deleted");
        }
        Ok(deleted)
    }

    /// Acquire a session-scoped lock for an idempotent operation (e.g.
    /// `"execute"` for agent dispatch, `"cancel"` for cancellation).
    pub fn lock_for(&self, session_id: &str, operation: &str) -> DistributedLock {
        let name = StoreKey::session_lock_name(session_id, operation);
        DistributedLock::new(self.store.clone(), &name, self.lock_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::memory::InMemoryStore;

    fn session_store() -> SessionStore {
        SessionStore::new(
            Arc::new(InMemoryStore::new()),
            Duration::from_secs(3600),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = session_store();
        store
            .create("s1", "hello".to_string(), Some("u1".to_string()), "{}".to_string())
            .await
            .unwrap();

        let session = store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.prompt, "hello");
        assert_eq!(session.user_id, Some("u1".to_string()));
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.message_count, 0);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = session_store();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_status_requires_existing_session() {
        let store = session_store();
        assert!(matches!(
            store.set_status("missing", SessionStatus::Processing).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = session_store();
        store
            .create("s1", "p".to_string(), None, "{}".to_string())
            .await
            .unwrap();
        store
            .update("s1", &[("task_id".to_string(), "t1".to_string())])
            .await
            .unwrap();
        let session = store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.task_id, Some("t1".to_string()));
        assert_eq!(session.prompt, "p");
    }

    #[tokio::test]
    async fn test_update_requires_existing_session() {
        let store = session_store();
        assert!(matches!(
            store
                .update("missing", &[("task_id".to_string(), "t1".to_string())])
                .await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_status_updates() {
        let store = session_store();
        store
            .create("s1", "p".to_string(), None, "{}".to_string())
            .await
            .unwrap();
        store
            .set_status("s1", SessionStatus::Processing)
            .await
            .unwrap();
        let session = store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Processing);
    }

    #[tokio::test]
    async fn test_increment_message_count() {
        let store = session_store();
        store
            .create("s1", "p".to_string(), None, "{}".to_string())
            .await
            .unwrap();
        assert_eq!(store.increment_message_count("s1").await.unwrap(), 1);
        assert_eq!(store.increment_message_count("s1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = session_store();
        store
            .create("s1", "p".to_string(), None, "{}".to_string())
            .await
            .unwrap();
        assert!(store.delete("s1").await.unwrap());
        assert!(store.get("s1").await.unwrap().is_none());
        assert!(!store.delete("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_for_scopes_by_session_and_operation() {
        let store = session_store();
        let mut lock_a = store.lock_for("s1", "execute");
        let mut lock_b = store.lock_for("s2", "execute");
        assert!(lock_a.acquire(Duration::from_millis(100)).await.unwrap());
        assert!(lock_b.acquire(Duration::from_millis(100)).await.unwrap());
    }
}
