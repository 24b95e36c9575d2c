//! CORS, request-id stamping, and the 404 fallback

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tower_http::cors::{Any, CorsLayer};

use super::extractors::request_id;

static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Wide open by design: this API has no cookie-based session, so there is
/// nothing for a credentialed CORS policy to protect.
pub fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            REQUEST_ID_HEADER.clone(),
            HeaderName::from_static("last-event-id"),
        ])
}

/// Stamps every response with `X-Request-Id`, echoing the caller's header
/// when supplied.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let id = request_id(request.headers());
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER.clone(), value);
    }
    response
}

pub async fn handle_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}
