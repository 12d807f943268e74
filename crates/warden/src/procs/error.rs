use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Failure of a single worker process.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The worker exited (or is exiting) before it could serve the request.
    /// Callers retry against a fresh worker.
    #[error("process closed")]
    Closed,

    #[error("spawning worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("refusing to start worker for invalid username {0:?}")]
    InvalidUser(String),

    #[error("worker not ready after {0:?}")]
    StartupTimeout(Duration),

    #[error("worker exited unexpectedly ({0})")]
    UnexpectedExit(ExitStatus),

    #[error("sending {signal} to worker: {source}")]
    Signal {
        signal: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("worker still running {0:?} after SIGKILL")]
    KillTimeout(Duration),

    #[error("waiting for worker exit: {0}")]
    Wait(#[source] io::Error),

    #[error("reading worker {stream}: {source}")]
    Output {
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("worker {0} not closed after exit")]
    OutputOpen(&'static str),

    #[error("worker protocol violation: {0}")]
    Protocol(String),

    #[error("connecting to worker: {0}")]
    Dial(String),
}

impl WorkerError {
    /// Whether this error means the process may still be running.
    ///
    /// Fatal errors come from the termination path and always indicate a
    /// leaked or unkillable process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::Signal { .. } | WorkerError::KillTimeout(_) | WorkerError::Wait(_)
        )
    }
}

/// A worker failure tagged with the user it belongs to.
#[derive(Error, Debug)]
#[error("worker for {user}: {err}")]
pub struct ProcError {
    pub user: String,
    #[source]
    pub err: WorkerError,
}

impl ProcError {
    pub fn new(user: impl Into<String>, err: WorkerError) -> Self {
        Self {
            user: user.into(),
            err,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.err.is_fatal()
    }
}

/// Errors returned by [`ProcStore::get`](super::ProcStore::get).
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("process store closed")]
    Closed,

    #[error("user {0} temporarily banned")]
    Banned(String),

    #[error("starting worker for {user}: {message}")]
    Spawn { user: String, message: String },
}

/// Aggregate result of shutting down every worker.
#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("workers still running after {0:?}")]
    Timeout(Duration),

    /// Users whose workers reported errors while shutting down.
    #[error("workers for {} failed to shut down cleanly", .0.join(", "))]
    Cleanup(Vec<String>),
}
