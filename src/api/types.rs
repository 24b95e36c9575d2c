//! Shared API error type (see SPEC_FULL.md §7)

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::data::eventlog::EventLogError;
use crate::data::session::SessionError;
use crate::data::store::StoreError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Unauthorized(String),
    RateLimited { retry_after: u64 },
    StoreUnavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(m) => write!(f, "validation error: {m}"),
            Self::NotFound(m) => write!(f, "not found: {m}"),
            Self::Unauthorized(m) => write!(f, "unauthorized: {m}"),
            Self::RateLimited { retry_after } => write!(f, "rate limited, retry after {retry_after}s"),
            Self::StoreUnavailable(m) => write!(f, "store unavailable: {m}"),
            Self::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, code, message) = match &self {
            Self::Validation(m) => (StatusCode::BAD_REQUEST, "bad_request", "validation_error", m.clone()),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", "not_found", m.clone()),
            Self::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "unauthorized", "unauthorized", m.clone()),
            Self::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "rate_limited",
                format!("rate limit exceeded, retry after {retry_after}s"),
            ),
            Self::StoreUnavailable(m) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                "store_unavailable",
                m.clone(),
            ),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal_error", m.clone()),
        };

        let mut response = (status, Json(ErrorBody { error, code, message })).into_response();
        match &self {
            Self::Unauthorized(_) => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            Self::RateLimited { retry_after } => {
                if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, v);
                }
            }
            _ => {}
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(id) => Self::NotFound(format!("session {id} not found")),
            SessionError::Store(store_err) => store_err.into(),
        }
    }
}

impl From<EventLogError> for ApiError {
    fn from(e: EventLogError) -> Self {
        match e {
            EventLogError::Store(store_err) => store_err.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        if e.is_transient() {
            Self::StoreUnavailable(e.to_string())
        } else {
            Self::Internal(e.to_string())
        }
    }
}
