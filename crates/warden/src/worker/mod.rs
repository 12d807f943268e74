//! Reference worker: serves one user's directory tree over a unix socket.
//!
//! The daemon spawns `warden-worker` once per user. The worker binds the
//! socket it was handed, prints the ready line and then serves read-only
//! file and directory requests until SIGTERM.

mod error;
mod handlers;

use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use axum::{Router, routing::get};
use tokio::net::UnixListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::procs::READY_LINE;

pub use error::WorkerHttpError;
pub use handlers::{DirEntry, EntryType, HealthResponse};

#[derive(Debug, Clone)]
pub struct WorkerState {
    /// Directory served at `/`.
    pub root: PathBuf,
    pub user: String,
}

pub fn router(state: WorkerState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/", get(handlers::get_root))
        .route("/{*path}", get(handlers::get_path))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `path`, replacing a socket file left behind by a previous run.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => info!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

/// Tell the supervising daemon we accept connections.
pub fn announce_ready(out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "{READY_LINE}")?;
    out.flush()
}

/// Serve until `shutdown` resolves, then remove the socket file.
pub async fn serve(
    listener: UnixListener,
    socket_path: &Path,
    state: WorkerState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;

    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    result
}
