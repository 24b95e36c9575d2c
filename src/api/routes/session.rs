//! `GET/DELETE /session/{id}` and `POST /session/{id}/cancel` (see SPEC_FULL.md §4.4, §4.5)

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Serialize;
use serde_json::json;

use super::super::AppState;
use super::super::types::{ApiError, ApiResult};

const CANCEL_FLAG_TTL_SECS: u64 = 300;

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub status: &'static str,
    pub prompt: String,
    pub user_id: Option<String>,
    pub message_count: u64,
    pub created_at: String,
    pub last_activity: String,
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionResponse>> {
    let session = state
        .sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session {session_id} not found")))?;

    Ok(Json(SessionResponse {
        session_id,
        status: status_str(session.status),
        prompt: session.prompt,
        user_id: session.user_id,
        message_count: session.message_count,
        created_at: session.created_at,
        last_activity: session.last_activity,
    }))
}

fn status_str(status: crate::data::session::SessionStatus) -> &'static str {
    use crate::data::session::SessionStatus::*;
    match status {
        Idle => "idle",
        Processing => "processing",
        Completed => "completed",
        Error => "error",
        Cancelled => "cancelled",
        Timeout => "timeout",
    }
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    let deleted = state.sessions.delete(&session_id).await?;
    if !deleted {
        return Err(ApiError::not_found(format!("session {session_id} not found")));
    }
    state.event_log.cleanup(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Sets the session's cancel flag (polled by the in-flight dispatch loop)
/// via `spawn_blocking`, since the publisher wraps a synchronous redis
/// client.
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.sessions.exists(&session_id).await? {
        return Err(ApiError::not_found(format!("session {session_id} not found")));
    }

    let publisher = state.publisher.clone();
    let id = session_id.clone();
    tokio::task::spawn_blocking(move || publisher.set_cancel_flag(&id, Duration::from_secs(CANCEL_FLAG_TTL_SECS)))
        .await
        .map_err(|e| ApiError::Internal(format!("cancel task panicked: {e}")))?
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    state.sessions.set_status(&session_id, crate::data::session::SessionStatus::Cancelled).await?;

    Ok(Json(json!({"session_id": session_id, "cancelled": true})))
}
