//! Request tracing for the control surface.
//!
//! Every request runs inside an `http_request` span carrying a request id,
//! taken from `X-Request-ID` when the caller sent one. The id is echoed
//! back on the response.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Registry writes are worth an info line; reads and scrapes stay at debug.
fn is_mutation(request: &Request<Body>) -> bool {
    request.uri().path() != "/metrics" && request.method() != axum::http::Method::GET
}

pub async fn request_tracing_middleware(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let start = Instant::now();

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();
    let mutation = is_mutation(&request);

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
        client_ip = %client_ip,
    );

    let mut response = next.run(request).instrument(span.clone()).await;

    let _guard = span.enter();
    let duration_ms = start.elapsed().as_millis() as u64;
    let status = response.status();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    if status.is_success() {
        if mutation {
            info!(status = status.as_u16(), duration_ms, "request completed");
        } else {
            tracing::debug!(status = status.as_u16(), duration_ms, "request completed");
        }
    } else if status.is_client_error() {
        warn!(status = status.as_u16(), duration_ms, "client error");
    } else {
        warn!(status = status.as_u16(), duration_ms, "server error");
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_id() {
        let id1 = generate_request_id();
        let id2 = generate_request_id();

        assert!(Uuid::parse_str(&id1).is_ok());
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_is_mutation() {
        let get = Request::builder().uri("/master").body(Body::empty()).unwrap();
        let post = Request::builder()
            .method("POST")
            .uri("/master")
            .body(Body::empty())
            .unwrap();
        assert!(!is_mutation(&get));
        assert!(is_mutation(&post));
    }
}
