//! Authentication
//!
//! Two credential forms (see SPEC_FULL.md §6): a flat `X-Api-Key` allowlist,
//! or an HS256 `Authorization: Bearer` session JWT. Auth is interface-only —
//! with neither `API_KEYS` nor `JWT_SECRET` configured, requests pass
//! through unauthenticated rather than being rejected, so local/demo use
//! doesn't require standing up credentials.

pub mod api_key;
pub mod jwt;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use super::AppState;

/// Identity attached to a request's extensions once authenticated.
#[derive(Debug, Clone)]
pub enum AuthContext {
    ApiKey { key_id: String },
    Jwt { user_id: String },
}

impl AuthContext {
    /// Identity to key rate limiting off of.
    pub fn rate_limit_identity(&self) -> String {
        match self {
            Self::ApiKey { key_id } => format!("key:{key_id}"),
            Self::Jwt { user_id } => format!("user:{user_id}"),
        }
    }

    /// User id to attach to dispatched events, falling back to the API key
    /// id when no JWT subject is available.
    pub fn user_id(&self) -> &str {
        match self {
            Self::ApiKey { key_id } => key_id,
            Self::Jwt { user_id } => user_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct AuthErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Debug)]
pub enum AuthError {
    Missing,
    Invalid(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            Self::Missing => "missing credentials".to_string(),
            Self::Invalid(m) => m,
        };
        let mut response = (
            StatusCode::UNAUTHORIZED,
            axum::Json(AuthErrorBody {
                error: "unauthorized",
                message,
            }),
        )
            .into_response();
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        response
    }
}

/// Authenticates `X-Api-Key` or `Authorization: Bearer`, inserting
/// [`AuthContext`] into the request's extensions when credentials are
/// present and valid. Passes through unauthenticated when neither form is
/// configured.
pub async fn auth_middleware(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let configured = !state.config.auth.api_keys.is_empty() || state.config.auth.jwt_secret.is_some();
    if !configured {
        return next.run(request).await;
    }

    let api_key_header = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let context = if let Some(presented) = api_key_header {
        match api_key::authenticate(&state.config.auth.api_keys, &presented) {
            Some(key_id) => AuthContext::ApiKey { key_id },
            None => return AuthError::Invalid("invalid API key".to_string()).into_response(),
        }
    } else if let Some(token) = bearer {
        let Some(secret) = &state.config.auth.jwt_secret else {
            return AuthError::Invalid("bearer tokens are not accepted".to_string()).into_response();
        };
        match jwt::validate_session_token(&token, secret.as_bytes()) {
            Ok(claims) => AuthContext::Jwt { user_id: claims.sub },
            Err(_) => return AuthError::Invalid("invalid or expired token".to_string()).into_response(),
        }
    } else {
        return AuthError::Missing.into_response();
    };

    request.extensions_mut().insert(context);
    next.run(request).await
}
