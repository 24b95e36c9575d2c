//! `GET /chat/stream` (see SPEC_FULL.md §4.2, §4.8)

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use uuid::Uuid;

use crate::sse::streamer::{self, StreamerConfig};

use super::super::AppState;
use super::super::types::ApiError;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub session_id: String,
    pub prompt: Option<String>,
}

/// Lifecycle step 1 (SPEC_FULL.md §4.8): look up the session; if it's
/// missing and `prompt` was supplied, create it and dispatch work, mirroring
/// `routes/stream.py`'s auto-create path. Otherwise 404.
async fn ensure_session(state: &AppState, query: &StreamQuery) -> Result<(), ApiError> {
    if state.sessions.exists(&query.session_id).await? {
        return Ok(());
    }

    let prompt = match &query.prompt {
        Some(p) if !p.trim().is_empty() => p.clone(),
        _ => {
            return Err(ApiError::not_found(format!(
                "session {} not found. Provide prompt parameter to create.",
                query.session_id
            )));
        }
    };

    state
        .sessions
        .create(&query.session_id, prompt.clone(), None, "{}".to_string())
        .await?;

    let dispatcher = state.dispatcher.clone();
    let session_id = query.session_id.clone();
    let task_id = Uuid::new_v4().to_string();
    tokio::spawn(async move {
        if let Err(e) = dispatcher.dispatch(&session_id, prompt, None, None, None, task_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "dispatch failed");
        }
    });

    Ok(())
}

pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: axum::http::HeaderMap,
) -> Result<Response, ApiError> {
    ensure_session(&state, &query).await?;

    // Replay is handled by `claim_stale` + a fresh-group `read_new` inside the
    // streamer itself; an explicit `Last-Event-ID` doesn't change which
    // entries are owed to a brand-new connection, since delivery is tracked
    // per consumer group rather than per client cursor.
    let _last_event_id = headers.get(header::HeaderName::from_static("last-event-id"));

    let config = StreamerConfig {
        heartbeat_interval: Duration::from_secs(state.config.sse.heartbeat_interval_secs),
        idle_timeout: Duration::from_secs(state.config.sse.idle_timeout_secs),
        read_batch_size: 10,
    };

    let connection_id = Uuid::new_v4().to_string();
    let body_stream = streamer::stream(
        state.event_log.clone(),
        state.sessions.clone(),
        state.backpressure.clone(),
        state.metrics.clone(),
        query.session_id,
        connection_id,
        config,
    )
    .map(|frame| Ok::<_, std::convert::Infallible>(frame.into_bytes()));

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store, must-revalidate"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Last-Event-ID"),
    );

    Ok(response.into_response())
}
