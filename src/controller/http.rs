//! HTTP control surface.
//!
//! `/master` is the registry CRUD endpoint: `GET` lists, `POST` adds, `PUT`
//! replaces and `DELETE` removes. Address lists are comma-separated in the
//! `masters` field of the query string or a form body.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Form, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;

use super::app::Orchestrator;
use super::middleware::request_tracing_middleware;
use crate::common::{parse_addrs, Error};

pub type AppState = Arc<Orchestrator>;

/// Form bodies only carry address lists.
const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/master", any(master))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/peers", any(peers))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn(request_tracing_middleware))
        .with_state(app)
}

/// `masters` may come from the query string or a form body; the query
/// string wins when both are present.
#[derive(Debug, Default, Deserialize)]
struct MastersParams {
    masters: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PeerParams {
    peer: Option<String>,
}

fn error_response(e: &Error) -> Response {
    (e.to_http_status(), Json(json!({ "error": e.to_string() }))).into_response()
}

async fn master(
    State(app): State<AppState>,
    method: Method,
    Query(query): Query<MastersParams>,
    form: Option<Form<MastersParams>>,
) -> Response {
    if method == Method::GET {
        return app.masters().join(",").into_response();
    }

    let masters = query
        .masters
        .or_else(|| form.and_then(|Form(body)| body.masters))
        .map(|list| parse_addrs(&list))
        .unwrap_or_default();

    let result = if method == Method::POST {
        app.add_masters(masters).await
    } else if method == Method::PUT {
        app.set_masters(masters).await
    } else if method == Method::DELETE {
        app.del_masters(masters).await
    } else {
        return (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, "GET, POST, PUT, DELETE")])
            .into_response();
    };

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn status(State(app): State<AppState>) -> impl IntoResponse {
    let cluster = app.cluster();
    Json(json!({
        "addr": app.config().addr,
        "broker": cluster.name(),
        "leader": cluster.leader(),
        "is_leader": cluster.is_leader(),
        "masters": app.masters(),
        "uptime_seconds": app.metrics().uptime_seconds(),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

async fn metrics(State(app): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        app.metrics().to_prometheus(),
    )
}

async fn peers(
    State(app): State<AppState>,
    method: Method,
    Query(query): Query<PeerParams>,
    form: Option<Form<PeerParams>>,
) -> Response {
    let cluster = app.cluster();
    if method == Method::GET {
        return match cluster.peers().await {
            Ok(peers) => Json(json!({ "peers": peers })).into_response(),
            Err(e) => error_response(&e),
        };
    }

    let peer = match query.peer.or_else(|| form.and_then(|Form(body)| body.peer)) {
        Some(peer) if !peer.trim().is_empty() => peer.trim().to_string(),
        _ => return error_response(&Error::InvalidConfig("missing peer".into())),
    };

    let result = if method == Method::POST {
        cluster.add_peer(peer).await
    } else if method == Method::DELETE {
        cluster.remove_peer(peer).await
    } else {
        return (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, "GET, POST, DELETE")])
            .into_response();
    };

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}
