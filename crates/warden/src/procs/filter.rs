//! Request entry point for per-user workers.
//!
//! Requests carrying an [`Identity`] are routed to that user's worker;
//! everything else falls through to the next handler. Every failure on the
//! way (ban, closed store, unreachable or crashed worker) is answered with a
//! plain 404 so clients learn nothing about the daemon's internals.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use log::{debug, warn};

use super::error::WorkerError;
use super::proc::Proc;
use super::proxy;
use super::store::ProcStore;

/// Username resolved by the upstream authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

#[derive(Clone)]
pub struct ProcessFilter {
    store: ProcStore,
    dial_timeout: Duration,
}

impl ProcessFilter {
    pub fn new(store: ProcStore, dial_timeout: Duration) -> Self {
        Self {
            store,
            dial_timeout,
        }
    }

    pub fn store(&self) -> &ProcStore {
        &self.store
    }

    /// Handle `req` if it carries an identity. Otherwise the request is
    /// handed back untouched for the next filter in the chain.
    pub async fn filter(&self, req: Request<Body>) -> Result<Response, Request<Body>> {
        let Some(Identity(user)) = req.extensions().get::<Identity>().cloned() else {
            return Err(req);
        };
        Ok(self.handle(req, &user).await)
    }

    /// Proxy `req` to the worker for `user`.
    pub async fn handle(&self, req: Request<Body>, user: &str) -> Response {
        let Some(proc) = self.ready_worker(user).await else {
            return not_found();
        };

        match proxy::forward(proc.socket_path(), req, self.dial_timeout).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Proxy to worker for {} failed: {}", user, e);
                self.store
                    .report_failure(user, WorkerError::Dial(e.to_string()))
                    .await;
                not_found()
            }
        }
    }

    /// Get a worker that has passed its readiness gate. A worker that closed
    /// under us (evicted between lookup and use) is replaced once.
    async fn ready_worker(&self, user: &str) -> Option<Arc<Proc>> {
        let mut retried = false;
        loop {
            let proc = match self.store.get(user).await {
                Ok(proc) => proc,
                Err(e) => {
                    warn!("No worker for {}: {}", user, e);
                    return None;
                }
            };

            match proc.serve().await {
                Ok(()) => return Some(proc),
                Err(WorkerError::Closed) if !retried => {
                    debug!("Worker for {} closed before serving, retrying", user);
                    retried = true;
                }
                Err(e) => {
                    warn!("Worker for {} unavailable: {}", user, e);
                    return None;
                }
            }
        }
    }
}

fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

/// Middleware form of [`ProcessFilter::filter`].
pub async fn process_filter(
    State(filter): State<ProcessFilter>,
    req: Request,
    next: Next,
) -> Response {
    match filter.filter(req).await {
        Ok(response) => response,
        Err(req) => next.run(req).await,
    }
}

/// Header trusted to carry the authenticated username.
#[derive(Debug, Clone)]
pub struct IdentityHeader(pub HeaderName);

/// Middleware attaching an [`Identity`] taken from the trusted header.
///
/// Only sound behind an authenticating front end that sets or strips the
/// header on every request.
pub async fn identity_from_header(
    State(header): State<IdentityHeader>,
    mut req: Request,
    next: Next,
) -> Response {
    let user = req
        .headers()
        .get(&header.0)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(str::to_string);

    if let Some(user) = user {
        req.extensions_mut().insert(Identity(user));
    }
    next.run(req).await
}
