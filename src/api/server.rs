//! Axum server assembly: routing, middleware ordering, bind, and graceful shutdown

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::app::CoreApp;

use super::auth::auth_middleware;
use super::middleware::{cors, handle_404, request_id_middleware};
use super::rate_limit::rate_limit_middleware;
use super::routes::{chat, health, session, stream};
use super::AppState;

pub struct ApiServer {
    app: CoreApp,
}

impl ApiServer {
    pub fn new(app: CoreApp) -> Self {
        Self { app }
    }

    pub async fn start(self) -> Result<CoreApp> {
        let shutdown = self.app.shutdown.clone();

        let state = AppState {
            config: Arc::new(self.app.config.clone()),
            store: self.app.store.clone(),
            sessions: self.app.sessions.clone(),
            event_log: self.app.event_log.clone(),
            rate_limiter: self.app.rate_limiter.clone(),
            backpressure: self.app.backpressure.clone(),
            publisher: self.app.publisher.clone(),
            dispatcher: self.app.dispatcher.clone(),
            metrics: self.app.metrics.clone(),
        };

        health::mark_start();

        let protected = Router::new()
            .route("/chat", post(chat::chat))
            .route("/chat/sync", post(chat::chat_sync))
            .route("/chat/stream", get(stream::stream))
            .route("/session/{id}", get(session::get_session).delete(session::delete_session))
            .route("/session/{id}/cancel", post(session::cancel_session))
            // Last-added layer runs first: auth populates `AuthContext` in the
            // request's extensions before the rate limiter reads it.
            .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
            .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

        let unprotected = Router::new()
            .route("/healthz", get(health::healthz))
            .route("/readyz", get(health::readyz))
            .route("/metrics", get(health::metrics));

        let router = Router::new()
            .merge(protected)
            .merge(unprotected)
            .fallback(handle_404)
            .layer(middleware::from_fn_with_state(state.clone(), http_timing_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .layer(cors())
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let addr = format!("{}:{}", self.app.config.server.host, self.app.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        tracing::info!(%addr, "listening");

        axum::serve(listener, router.into_make_service_with_connect_info::<std::net::SocketAddr>())
            .with_graceful_shutdown(shutdown.wait())
            .await
            .context("server error")?;

        Ok(self.app)
    }
}

/// Buckets path-parameterized routes so `http_request_duration_seconds`
/// doesn't grow an unbounded label cardinality from raw session ids.
fn normalize_path(path: &str) -> &'static str {
    if path == "/chat" || path == "/chat/sync" || path == "/chat/stream" {
        return match path {
            "/chat" => "/chat",
            "/chat/sync" => "/chat/sync",
            _ => "/chat/stream",
        };
    }
    if path.starts_with("/session/") {
        return if path.ends_with("/cancel") { "/session/{id}/cancel" } else { "/session/{id}" };
    }
    match path {
        "/healthz" => "/healthz",
        "/readyz" => "/readyz",
        "/metrics" => "/metrics",
        _ => "other",
    }
}

async fn http_timing_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let endpoint = normalize_path(request.uri().path());
    let started = Instant::now();
    let response = next.run(request).await;
    state.metrics.record_http_request(&method, endpoint, started);
    response
}
