//! Small request-derived helpers shared by handlers and middleware

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::HeaderMap;

/// Best-effort client address: the first hop of `X-Forwarded-For` (set by a
/// trusted reverse proxy) if present, else the raw socket peer.
pub fn client_ip(headers: &HeaderMap, connect_info: Option<&ConnectInfo<SocketAddr>>) -> String {
    if let Some(value) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = value.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Echoes the caller's `X-Request-Id` if present, else mints a fresh one.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(*k, v.parse().unwrap());
        }
        headers
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let headers = headers_with(&[("x-forwarded-for", "1.2.3.4, 5.6.7.8")]);
        assert_eq!(client_ip(&headers, None), "1.2.3.4");
    }

    #[test]
    fn test_client_ip_falls_back_to_unknown() {
        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, None), "unknown");
    }

    #[test]
    fn test_request_id_echoes_existing() {
        let headers = headers_with(&[("x-request-id", "req-123")]);
        assert_eq!(request_id(&headers), "req-123");
    }

    #[test]
    fn test_request_id_generates_when_absent() {
        let headers = HeaderMap::new();
        assert!(!request_id(&headers).is_empty());
    }
}
