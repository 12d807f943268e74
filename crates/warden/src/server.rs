//! HTTP front of the daemon.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::procs::{
    IdentityHeader, ProcStore, ProcessFilter, identity_from_header, process_filter,
};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub workers: usize,
}

/// Build the daemon router.
///
/// Requests carrying the identity header go to that user's worker. The rest
/// (load balancer health checks, mostly) reach the local routes.
pub fn create_router(
    store: ProcStore,
    dial_timeout: Duration,
    user_header: IdentityHeader,
) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let filter = ProcessFilter::new(store.clone(), dial_timeout);

    Router::new()
        .route("/healthz", get(health))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(store)
        .layer(from_fn_with_state(filter, process_filter))
        .layer(from_fn_with_state(user_header, identity_from_header))
        .layer(trace_layer)
}

async fn health(State(store): State<ProcStore>) -> Response {
    match store.users().await {
        Ok(users) => Json(HealthResponse {
            status: "ok",
            workers: users.len(),
        })
        .into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response(),
    }
}
