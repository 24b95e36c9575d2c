//! `POST /chat` and `POST /chat/sync` (see SPEC_FULL.md §4.1, §4.3)

use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{Extension, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::data::session::SessionStatus;

use super::super::AppState;
use super::super::auth::AuthContext;
use super::super::types::{ApiError, ApiResult};

/// `session_id` is a query parameter on both `/chat` and `/chat/sync`, not a
/// body field — an existing session is resumed, a missing one is created.
#[derive(Debug, Deserialize)]
pub struct SessionIdQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub context: Option<Value>,
    pub model: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub task_id: String,
    pub stream_url: String,
}

async fn resolve_session(
    state: &AppState,
    session_id: Option<String>,
    message: &str,
    user_id: Option<String>,
    context: &Option<Value>,
) -> ApiResult<String> {
    if message.trim().is_empty() {
        return Err(ApiError::validation("message must not be empty"));
    }

    let context_json = context
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "{}".to_string());

    match session_id {
        Some(id) => {
            if state.sessions.exists(&id).await? {
                state.sessions.increment_message_count(&id).await?;
                state.sessions.set_status(&id, SessionStatus::Idle).await?;
            } else {
                state.sessions.create(&id, message.to_string(), user_id, context_json).await?;
            }
            Ok(id)
        }
        None => {
            let id = Uuid::new_v4().to_string();
            state.sessions.create(&id, message.to_string(), user_id, context_json).await?;
            Ok(id)
        }
    }
}

/// Fire-and-forget: dispatch runs to completion on a spawned task while this
/// handler returns as soon as the session is created, so the caller opens
/// `GET /chat/stream` to observe progress.
pub async fn chat(
    State(state): State<AppState>,
    Query(query): Query<SessionIdQuery>,
    auth: Option<Extension<AuthContext>>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<(StatusCode, Json<ChatResponse>)> {
    let user_id = auth
        .as_ref()
        .map(|Extension(ctx)| ctx.user_id().to_string())
        .or(req.user_id.clone());
    let session_id =
        resolve_session(&state, query.session_id, &req.message, user_id.clone(), &req.context).await?;

    let dispatcher = state.dispatcher.clone();
    let task_id = Uuid::new_v4().to_string();
    let dispatch_task_id = task_id.clone();
    let dispatch_session_id = session_id.clone();
    let message = req.message.clone();
    let context = req.context.clone();
    let model = req.model.clone();

    tokio::spawn(async move {
        if let Err(e) = dispatcher
            .dispatch(&dispatch_session_id, message, context, user_id, model, dispatch_task_id)
            .await
        {
            tracing::warn!(session_id = %dispatch_session_id, error = %e, "dispatch failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(ChatResponse {
            stream_url: format!("/chat/stream?session_id={session_id}"),
            session_id,
            task_id,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ChatSyncRequest {
    pub message: String,
    pub context: Option<Value>,
    pub model: Option<String>,
    pub user_id: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ChatSyncResponse {
    pub session_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: f64,
}

/// Matches `routes/chat.py`'s synchronous fallback default.
const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 60;

/// Awaits dispatch to a terminal outcome directly, then replays the
/// session's event stream through a fresh consumer group (which starts at
/// stream position 0) to recover the `final`/`error` event's payload.
///
/// Every failure mode below — timeout, a dispatch-plumbing error, a missing
/// terminal event — is surfaced as `success:false` in a normal 200 body,
/// mirroring `routes/chat.py`'s `except TimeoutError`/`except Exception`
/// handling rather than an HTTP error status.
pub async fn chat_sync(
    State(state): State<AppState>,
    Query(query): Query<SessionIdQuery>,
    auth: Option<Extension<AuthContext>>,
    Json(req): Json<ChatSyncRequest>,
) -> ApiResult<Json<ChatSyncResponse>> {
    let started = Instant::now();
    let user_id = auth
        .as_ref()
        .map(|Extension(ctx)| ctx.user_id().to_string())
        .or(req.user_id.clone());
    let session_id =
        resolve_session(&state, query.session_id, &req.message, user_id.clone(), &req.context).await?;

    let timeout_secs = req.timeout_seconds.unwrap_or(DEFAULT_SYNC_TIMEOUT_SECS);
    let timeout = Duration::from_secs(timeout_secs);
    let task_id = Uuid::new_v4().to_string();

    let dispatch = state.dispatcher.dispatch(
        &session_id,
        req.message.clone(),
        req.context.clone(),
        user_id,
        req.model.clone(),
        task_id,
    );

    match tokio::time::timeout(timeout, dispatch).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            state.sessions.set_status(&session_id, SessionStatus::Error).await?;
            return Ok(Json(ChatSyncResponse {
                session_id,
                success: false,
                result: None,
                error: Some(e.to_string()),
                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            }));
        }
        Err(_) => {
            state.sessions.set_status(&session_id, SessionStatus::Timeout).await?;
            return Ok(Json(ChatSyncResponse {
                session_id,
                success: false,
                result: None,
                error: Some(format!("Request timed out after {timeout_secs}s")),
                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            }));
        }
    }

    let consumer = state.event_log.ensure_group(&session_id).await?;
    let events = state.event_log.read_new(&session_id, &consumer, 1000).await?;
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

    let Some(terminal) = events.into_iter().find(|e| e.is_terminal()) else {
        return Ok(Json(ChatSyncResponse {
            session_id,
            success: false,
            result: None,
            error: Some("dispatch completed without a terminal event".to_string()),
            duration_ms,
        }));
    };

    let data: Value = serde_json::from_str(&terminal.data)
        .map_err(|e| ApiError::Internal(format!("malformed event payload: {e}")))?;

    if terminal.event_type == "final" {
        Ok(Json(ChatSyncResponse {
            session_id,
            success: true,
            result: Some(data),
            error: None,
            duration_ms,
        }))
    } else {
        let error = data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("agent execution failed")
            .to_string();
        Ok(Json(ChatSyncResponse {
            session_id,
            success: false,
            result: None,
            error: Some(error),
            duration_ms,
        }))
    }
}
