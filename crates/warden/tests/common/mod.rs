//! Test utilities and common setup.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderName, Request, Response, StatusCode};
use axum::routing::any;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

use warden::config::ProcSettings;
use warden::procs::{IdentityHeader, ProcStore, ShutdownError};
use warden::server::create_router;

pub const USER_HEADER: &str = "x-warden-user";

/// Worker that becomes ready immediately and never binds its socket.
pub const IDLE_WORKER: &str = "echo ready; exec sleep 30";

/// Settings running `script` under `/bin/sh` with short timeouts.
pub fn sh_settings(script: &str, socket_dir: &Path) -> ProcSettings {
    let mut settings = ProcSettings::new("/bin/sh", socket_dir);
    settings.args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
    settings.startup_timeout = Duration::from_secs(5);
    settings.exit_timeout = Duration::from_secs(2);
    settings.shutdown_timeout = Duration::from_secs(10);
    settings.dial_timeout = Duration::from_millis(500);
    settings
}

/// Start a store and return the daemon router in front of it.
pub fn test_app(
    settings: ProcSettings,
) -> (Router, ProcStore, JoinHandle<Result<(), ShutdownError>>) {
    let dial_timeout = settings.dial_timeout;
    let (store, coordinator) = ProcStore::new(settings);
    let handle = tokio::spawn(coordinator.run(None));
    let header = IdentityHeader(HeaderName::from_static(USER_HEADER));
    let app = create_router(store.clone(), dial_timeout, header);
    (app, store, handle)
}

/// Serve an echo app on `path`, standing in for a worker.
pub fn serve_echo(path: &Path) {
    let listener = UnixListener::bind(path).unwrap();
    let app = Router::new().fallback(any(echo));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

async fn echo(req: Request<Body>) -> Response<Body> {
    let user = req
        .headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::from(format!("{} {} {}", user, req.method(), req.uri())))
        .unwrap()
}

pub fn user_request(user: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(USER_HEADER, user)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
