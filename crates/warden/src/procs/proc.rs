//! Handle to one user's worker process.
//!
//! A worker is started with piped stdout/stderr. Its stdout doubles as a
//! control channel: the single line [`READY_LINE`] opens the readiness gate,
//! every other line is passed through to our own log. A supervisor task owns
//! the [`Child`] and drives the rest of the lifecycle:
//!
//! - the process exits on its own: reported as an unexpected exit;
//! - [`Proc::close`] is called: SIGTERM, then SIGKILL after `exit_timeout`;
//! - no ready line within `startup_timeout`: same as close, plus a
//!   startup-timeout error.
//!
//! In every case both output streams are drained and the collected errors
//! are handed back as an [`ExitReport`] through the supervisor's join handle.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use rustix::process::geteuid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::{ProcSettings, is_valid_username};

use super::error::WorkerError;

/// Line a worker prints on stdout once its socket accepts connections.
pub const READY_LINE: &str = "ready";

/// Environment variable carrying the socket path to the worker.
pub const SOCKET_ENV: &str = "WARDEN_SOCKET";

/// How a line of worker stdout is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// The readiness sentinel. Never forwarded to the log.
    Ready,
    /// Anything else, logged verbatim.
    Output,
}

pub fn classify_line(line: &str) -> LineKind {
    if line.trim_end_matches(['\r', '\n']) == READY_LINE {
        LineKind::Ready
    } else {
        LineKind::Output
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Starting,
    Ready,
    /// No ready line within the startup timeout; being terminated.
    TimedOut,
    /// Termination requested or observed; the process may still be running.
    Closing,
    /// Reaped and both output streams drained.
    Exited,
}

/// Outcome of a worker's lifetime.
#[derive(Debug)]
pub struct ExitReport {
    pub user: String,
    pub pid: u32,
    /// Exit status, if the process was reaped.
    pub status: Option<ExitStatus>,
    /// Whether termination was requested (close or startup timeout) rather
    /// than the process exiting on its own.
    pub requested: bool,
    pub errors: Vec<WorkerError>,
}

impl ExitReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A freshly started worker together with its supervisor.
pub struct Spawned {
    pub proc: Arc<Proc>,
    /// Resolves once the process is gone and its output drained.
    pub exit: JoinHandle<ExitReport>,
}

/// Shared handle to a running worker.
#[derive(Debug)]
pub struct Proc {
    user: String,
    pid: u32,
    socket_path: PathBuf,
    state: Arc<watch::Sender<State>>,
    /// Cancelled to request termination; observed by `serve` as "closed".
    exit: CancellationToken,
    last_access: watch::Sender<Instant>,
    startup_timeout: Duration,
}

impl Proc {
    /// Start the worker for `user`.
    ///
    /// Returns as soon as the process is running; readiness is awaited by
    /// [`Proc::serve`]. Must be called inside a tokio runtime.
    pub fn spawn(user: &str, settings: &ProcSettings) -> Result<Spawned, WorkerError> {
        if !is_valid_username(user) {
            return Err(WorkerError::InvalidUser(user.to_string()));
        }
        let socket_path = settings.socket_path(user);
        let mut cmd = worker_command(settings, user, &socket_path)?;
        cmd.env(SOCKET_ENV, &socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(WorkerError::Spawn)?;
        let pid = child
            .id()
            .ok_or_else(|| WorkerError::Spawn(io::Error::other("worker exited immediately")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn(io::Error::other("worker stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkerError::Spawn(io::Error::other("worker stderr not captured")))?;

        let state = Arc::new(watch::channel(State::Starting).0);
        let exit = CancellationToken::new();

        let readers = [
            tokio::spawn(read_output(
                user.to_string(),
                "stdout",
                stdout,
                Some(Arc::clone(&state)),
            )),
            tokio::spawn(read_output(user.to_string(), "stderr", stderr, None)),
        ];

        let supervisor = Supervisor {
            user: user.to_string(),
            pid,
            child,
            state: Arc::clone(&state),
            exit: exit.clone(),
            socket_path: socket_path.clone(),
            startup_timeout: settings.startup_timeout,
            exit_timeout: settings.exit_timeout,
            readers,
        };

        info!(
            "Spawned worker for {} (PID {}) on {}",
            user,
            pid,
            socket_path.display()
        );

        Ok(Spawned {
            proc: Arc::new(Proc {
                user: user.to_string(),
                pid,
                socket_path,
                state,
                exit,
                last_access: watch::channel(Instant::now()).0,
                startup_timeout: settings.startup_timeout,
            }),
            exit: tokio::spawn(supervisor.run()),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Last time a request was admitted by [`Proc::serve`].
    pub fn last_access(&self) -> Instant {
        *self.last_access.borrow()
    }

    /// Wait until the worker is ready to accept a request.
    ///
    /// Fails with [`WorkerError::StartupTimeout`] if the worker never became
    /// ready, and with [`WorkerError::Closed`] if it is shutting down or
    /// exited before becoming ready; on `Closed` the caller should retry
    /// with a new worker. Bounded by the startup timeout.
    pub async fn serve(&self) -> Result<(), WorkerError> {
        let mut state = self.state.subscribe();
        let settled = state
            .wait_for(|s| *s != State::Starting)
            .await
            .map(|s| *s)
            .unwrap_or(State::Exited);

        match settled {
            State::Ready if !self.exit.is_cancelled() => {
                self.last_access.send_replace(Instant::now());
                Ok(())
            }
            State::TimedOut => Err(WorkerError::StartupTimeout(self.startup_timeout)),
            _ => Err(WorkerError::Closed),
        }
    }

    /// Request termination. Idempotent; does not wait.
    pub fn close(&self) {
        if !self.exit.is_cancelled() {
            debug!("Closing worker for {} (PID {})", self.user, self.pid);
            self.exit.cancel();
        }
    }

    /// Whether termination was requested or the process already exited.
    pub fn is_closed(&self) -> bool {
        self.exit.is_cancelled()
            || matches!(
                *self.state.borrow(),
                State::TimedOut | State::Closing | State::Exited
            )
    }

    /// Whether the process has been reaped.
    pub fn has_exited(&self) -> bool {
        *self.state.borrow() == State::Exited
    }

    /// Wait until the process has been reaped and its output drained.
    pub async fn wait(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == State::Exited).await;
    }
}

/// Build the worker command, switching to the user's Linux account if
/// configured.
fn worker_command(
    settings: &ProcSettings,
    user: &str,
    socket_path: &Path,
) -> Result<Command, WorkerError> {
    let args = settings.worker_args(user);

    if !settings.run_as.enabled {
        debug!("Spawning {} as current user: {:?}", settings.command, args);
        let mut cmd = Command::new(&settings.command);
        cmd.args(&args);
        return Ok(cmd);
    }

    if geteuid().is_root() {
        // su resets the environment, so the socket path goes on the command line.
        let full_cmd = std::iter::once(settings.command.as_str())
            .chain(args.iter().map(String::as_str))
            .map(shell_escape)
            .collect::<Vec<_>>()
            .join(" ");
        let full_cmd = format!(
            "{}={} exec {}",
            SOCKET_ENV,
            shell_escape(&socket_path.to_string_lossy()),
            full_cmd
        );

        debug!("Spawning worker as user '{}' via su: {}", user, full_cmd);
        let mut cmd = Command::new("su");
        cmd.arg("-").arg(user).arg("-c").arg(full_cmd);
        Ok(cmd)
    } else if settings.run_as.use_sudo {
        debug!(
            "Spawning {} as user '{}' via sudo: {:?}",
            settings.command, user, args
        );
        let mut cmd = Command::new("sudo");
        cmd.arg("-n")
            .arg("-u")
            .arg(user)
            .arg(format!("--preserve-env={}", SOCKET_ENV))
            .arg("--")
            .arg(&settings.command)
            .args(&args);
        Ok(cmd)
    } else {
        Err(WorkerError::Spawn(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!(
                "cannot run as user '{}': not root and use_sudo is false",
                user
            ),
        )))
    }
}

/// Escape a string for safe use in a shell command.
fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Forward worker output to the log until end of stream.
///
/// When `state` is given the stream is stdout and the ready line opens the
/// gate instead of being logged.
async fn read_output<R>(
    user: String,
    stream: &'static str,
    output: R,
    state: Option<Arc<watch::Sender<State>>>,
) -> Vec<WorkerError>
where
    R: AsyncRead + Unpin,
{
    let mut errors = Vec::new();
    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();
    let mut seen_ready = false;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(source) => {
                errors.push(WorkerError::Output { stream, source });
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);

        match (&state, classify_line(line)) {
            (Some(state), LineKind::Ready) => {
                if seen_ready {
                    errors.push(WorkerError::Protocol(format!(
                        "repeated '{}' line",
                        READY_LINE
                    )));
                    continue;
                }
                seen_ready = true;
                let opened = state.send_if_modified(|s| {
                    if *s == State::Starting {
                        *s = State::Ready;
                        true
                    } else {
                        false
                    }
                });
                if opened {
                    debug!("Worker for {} is ready", user);
                }
            }
            _ => info!(target: "warden::worker", "[{}] {}", user, line),
        }
    }

    errors
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    Requested,
    StartupTimeout,
}

struct Supervisor {
    user: String,
    pid: u32,
    child: Child,
    state: Arc<watch::Sender<State>>,
    exit: CancellationToken,
    socket_path: PathBuf,
    startup_timeout: Duration,
    exit_timeout: Duration,
    readers: [JoinHandle<Vec<WorkerError>>; 2],
}

impl Supervisor {
    async fn run(mut self) -> ExitReport {
        let outcome = tokio::select! {
            status = self.child.wait() => Outcome::Exited(status),
            _ = self.exit.cancelled() => Outcome::Requested,
            _ = startup_deadline(self.state.subscribe(), self.startup_timeout) => {
                Outcome::StartupTimeout
            }
        };
        self.state.send_replace(if matches!(outcome, Outcome::StartupTimeout) {
            State::TimedOut
        } else {
            State::Closing
        });

        let mut errors = Vec::new();
        let mut requested = true;
        let status = match outcome {
            Outcome::Exited(Ok(status)) => {
                if self.exit.is_cancelled() {
                    debug!("Worker for {} exited while closing: {}", self.user, status);
                } else {
                    warn!(
                        "Worker for {} (PID {}) exited unexpectedly: {}",
                        self.user, self.pid, status
                    );
                    requested = false;
                    errors.push(WorkerError::UnexpectedExit(status));
                }
                Some(status)
            }
            Outcome::Exited(Err(e)) => {
                errors.push(WorkerError::Wait(e));
                self.terminate(&mut errors).await
            }
            Outcome::Requested => self.terminate(&mut errors).await,
            Outcome::StartupTimeout => {
                warn!(
                    "Worker for {} (PID {}) not ready after {:?}",
                    self.user, self.pid, self.startup_timeout
                );
                errors.push(WorkerError::StartupTimeout(self.startup_timeout));
                self.exit.cancel();
                self.terminate(&mut errors).await
            }
        };

        self.drain(&mut errors).await;
        self.remove_socket();
        self.state.send_replace(State::Exited);

        debug!(
            "Worker for {} (PID {}) gone: status {:?}, {} error(s)",
            self.user,
            self.pid,
            status,
            errors.len()
        );

        ExitReport {
            user: self.user,
            pid: self.pid,
            status,
            requested,
            errors,
        }
    }

    /// SIGTERM, wait, SIGKILL, wait.
    async fn terminate(&mut self, errors: &mut Vec<WorkerError>) -> Option<ExitStatus> {
        debug!("Sending SIGTERM to worker for {} (PID {})", self.user, self.pid);
        match send_signal(self.pid, Signal::SIGTERM) {
            Ok(()) => match timeout(self.exit_timeout, self.child.wait()).await {
                Ok(Ok(status)) => return Some(status),
                Ok(Err(e)) => errors.push(WorkerError::Wait(e)),
                Err(_) => warn!(
                    "Worker for {} (PID {}) ignored SIGTERM for {:?}, killing",
                    self.user, self.pid, self.exit_timeout
                ),
            },
            Err(source) => errors.push(WorkerError::Signal {
                signal: "SIGTERM",
                source,
            }),
        }

        if let Err(source) = self.child.start_kill() {
            errors.push(WorkerError::Signal {
                signal: "SIGKILL",
                source,
            });
        }

        match timeout(self.exit_timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                errors.push(WorkerError::Wait(e));
                None
            }
            Err(_) => {
                errors.push(WorkerError::KillTimeout(self.exit_timeout));
                None
            }
        }
    }

    /// Collect the output readers. A stream still open after the process is
    /// gone (an inherited pipe in a grandchild) is abandoned after
    /// `exit_timeout`.
    async fn drain(&mut self, errors: &mut Vec<WorkerError>) {
        for (reader, stream) in self.readers.iter_mut().zip(["stdout", "stderr"]) {
            match timeout(self.exit_timeout, &mut *reader).await {
                Ok(Ok(reader_errors)) => errors.extend(reader_errors),
                Ok(Err(join_err)) => errors.push(WorkerError::Output {
                    stream,
                    source: io::Error::other(join_err),
                }),
                Err(_) => {
                    reader.abort();
                    errors.push(WorkerError::OutputOpen(stream));
                }
            }
        }
    }

    fn remove_socket(&self) {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!("Removed stale socket {}", self.socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove socket {}: {}",
                self.socket_path.display(),
                e
            ),
        }
    }
}

/// Resolves if the worker is still starting after `limit`; never otherwise.
async fn startup_deadline(mut state: watch::Receiver<State>, limit: Duration) {
    let settled = timeout(limit, state.wait_for(|s| *s != State::Starting))
        .await
        .is_ok();
    if settled {
        std::future::pending::<()>().await;
    }
}

fn send_signal(pid: u32, sig: Signal) -> io::Result<()> {
    let raw = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    signal::kill(Pid::from_raw(raw), sig).map_err(io::Error::from)
}
