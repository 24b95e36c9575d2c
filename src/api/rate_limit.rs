//! Rate limit middleware
//!
//! Applies a route-specific [`RateLimitRule`] ahead of the handler and
//! stamps every response — limited or not — with `X-RateLimit-*` (see
//! SPEC_FULL.md §6). The identifier is the authenticated user when
//! [`AuthContext`] is present in the request's extensions, else client IP.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::data::store::RateLimitRule;

use super::AppState;
use super::auth::AuthContext;
use super::extractors::client_ip;

fn rule_for(path: &str, default_requests: u32, default_window_secs: u64) -> RateLimitRule {
    match path {
        "/chat/stream" => RateLimitRule::new("chat_stream", 30, 60),
        "/chat" => RateLimitRule::new("chat", 60, 60),
        "/chat/sync" => RateLimitRule::new("chat_sync", 60, 60),
        _ => RateLimitRule::new("default", default_requests, default_window_secs),
    }
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let identifier = request
        .extensions()
        .get::<AuthContext>()
        .map(AuthContext::rate_limit_identity)
        .unwrap_or_else(|| format!("ip:{}", client_ip(request.headers(), connect_info.as_ref())));

    let rule = rule_for(
        &path,
        state.config.rate_limit.requests,
        state.config.rate_limit.window_secs,
    );
    let result = state.rate_limiter.check(&rule, &identifier).await;

    if !result.allowed {
        state.metrics.record_rate_limit_hit(&path);
    }

    let mut response = if result.allowed {
        next.run(request).await
    } else {
        StatusCode::TOO_MANY_REQUESTS.into_response()
    };

    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&result.limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&result.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&result.reset_at.to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }
    if let Some(retry_after) = result.retry_after {
        if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
            headers.insert("retry-after", v);
        }
    }
    response
}
