//! Daemon configuration.
//!
//! Every section falls back to its defaults, so a partial TOML file (or no
//! file at all) is a valid configuration. [`ProcsConfig::settings`] turns the
//! serialisable form into the [`ProcSettings`] consumed by the process store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Placeholder replaced with the username in worker arguments.
pub const USER_PLACEHOLDER: &str = "{user}";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("procs.command must not be empty")]
    EmptyCommand,

    #[error("procs.{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("procs.max_failures must be at least 1")]
    ZeroFailures,

    #[error("procs.user_flag must not be empty")]
    EmptyUserFlag,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub server: ServerConfig,
    pub procs: ProcsConfig,
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Header carrying the username resolved by the upstream auth layer.
    /// Requests without it are not handled by the process filter.
    pub user_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            user_header: "x-warden-user".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Per-user worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcsConfig {
    /// Maximum number of concurrent workers (0 = unlimited).
    pub max_procs: usize,
    /// Workers unused for this long are shut down.
    pub idle_timeout_secs: u64,
    /// How often idle workers and expired bans are swept.
    pub idle_check_period_secs: u64,
    /// Worker executable.
    pub command: String,
    /// Base arguments passed before the user flag. `{user}` is substituted.
    pub args: Vec<String>,
    /// Flag preceding the username on the worker command line.
    pub user_flag: String,
    /// Directory holding the per-user unix sockets.
    pub socket_dir: PathBuf,
    /// Time a worker has to print its ready line.
    pub startup_timeout_secs: u64,
    /// Time a worker has to exit after SIGTERM, and again after SIGKILL.
    pub exit_timeout_secs: u64,
    /// Overall budget for closing every worker at shutdown.
    pub shutdown_timeout_secs: u64,
    /// Timeout for connecting to a worker socket.
    pub dial_timeout_ms: u64,
    /// Failures tolerated within the failure window before a user is banned.
    pub max_failures: usize,
    /// Failure accounting window, also the ban duration.
    pub failure_window_secs: u64,
    /// Capacity of the diagnostic error channel.
    pub diagnostics_buffer: usize,
    /// Run each worker as the Linux user of the same name.
    pub run_as: RunAsConfig,
}

impl Default for ProcsConfig {
    fn default() -> Self {
        Self {
            max_procs: 0,
            idle_timeout_secs: 600,
            idle_check_period_secs: 30,
            command: "warden-worker".to_string(),
            args: vec!["--root".to_string(), "/home/{user}".to_string()],
            user_flag: "--user".to_string(),
            socket_dir: PathBuf::from("/run/warden"),
            startup_timeout_secs: 10,
            exit_timeout_secs: 5,
            shutdown_timeout_secs: 30,
            dial_timeout_ms: 2_000,
            max_failures: 3,
            failure_window_secs: 300,
            diagnostics_buffer: 64,
            run_as: RunAsConfig::default(),
        }
    }
}

/// Options for running workers as a specific Linux user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunAsConfig {
    /// Switch to the Linux account matching the username.
    pub enabled: bool,
    /// Use sudo to switch users when not running as root.
    pub use_sudo: bool,
}

impl ProcsConfig {
    /// Validate and convert into runtime settings.
    pub fn settings(&self) -> Result<ProcSettings, ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        if self.user_flag.is_empty() {
            return Err(ConfigError::EmptyUserFlag);
        }
        if self.max_failures == 0 {
            return Err(ConfigError::ZeroFailures);
        }
        if self.dial_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("dial_timeout_ms"));
        }
        let dial_timeout = Duration::from_millis(self.dial_timeout_ms);

        Ok(ProcSettings {
            max_procs: self.max_procs,
            idle_timeout: nonzero_secs("idle_timeout_secs", self.idle_timeout_secs)?,
            idle_check_period: nonzero_secs(
                "idle_check_period_secs",
                self.idle_check_period_secs,
            )?,
            command: self.command.clone(),
            args: self.args.clone(),
            user_flag: self.user_flag.clone(),
            socket_dir: self.socket_dir.clone(),
            startup_timeout: nonzero_secs("startup_timeout_secs", self.startup_timeout_secs)?,
            exit_timeout: nonzero_secs("exit_timeout_secs", self.exit_timeout_secs)?,
            shutdown_timeout: nonzero_secs("shutdown_timeout_secs", self.shutdown_timeout_secs)?,
            dial_timeout,
            max_failures: self.max_failures,
            failure_window: nonzero_secs("failure_window_secs", self.failure_window_secs)?,
            run_as: self.run_as.clone(),
        })
    }
}

fn nonzero_secs(name: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::ZeroDuration(name));
    }
    Ok(Duration::from_secs(secs))
}

/// Runtime settings for the process store and its workers.
#[derive(Debug, Clone)]
pub struct ProcSettings {
    pub max_procs: usize,
    pub idle_timeout: Duration,
    pub idle_check_period: Duration,
    pub command: String,
    pub args: Vec<String>,
    pub user_flag: String,
    pub socket_dir: PathBuf,
    pub startup_timeout: Duration,
    pub exit_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub dial_timeout: Duration,
    pub max_failures: usize,
    pub failure_window: Duration,
    pub run_as: RunAsConfig,
}

impl ProcSettings {
    /// Settings for `command` with sockets under `socket_dir` and default
    /// limits for everything else.
    pub fn new(command: impl Into<String>, socket_dir: impl Into<PathBuf>) -> Self {
        let defaults = ProcsConfig::default();
        Self {
            max_procs: defaults.max_procs,
            idle_timeout: Duration::from_secs(defaults.idle_timeout_secs),
            idle_check_period: Duration::from_secs(defaults.idle_check_period_secs),
            command: command.into(),
            args: Vec::new(),
            user_flag: defaults.user_flag,
            socket_dir: socket_dir.into(),
            startup_timeout: Duration::from_secs(defaults.startup_timeout_secs),
            exit_timeout: Duration::from_secs(defaults.exit_timeout_secs),
            shutdown_timeout: Duration::from_secs(defaults.shutdown_timeout_secs),
            dial_timeout: Duration::from_millis(defaults.dial_timeout_ms),
            max_failures: defaults.max_failures,
            failure_window: Duration::from_secs(defaults.failure_window_secs),
            run_as: RunAsConfig::default(),
        }
    }

    /// Private socket path for `user`.
    ///
    /// The readable part is sanitised; the hash suffix keeps paths distinct
    /// for usernames that sanitise to the same string.
    pub fn socket_path(&self, user: &str) -> PathBuf {
        socket_path_in(&self.socket_dir, user)
    }

    /// Full worker argument list for `user`: base args, then user flag and name.
    pub fn worker_args(&self, user: &str) -> Vec<String> {
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace(USER_PLACEHOLDER, user))
            .collect();
        args.push(self.user_flag.clone());
        args.push(user.to_string());
        args
    }
}

fn socket_path_in(dir: &Path, user: &str) -> PathBuf {
    let digest = Sha256::digest(user.as_bytes());
    let hash = hex::encode(&digest[..6]);
    dir.join(format!("{}-{}.sock", sanitize_username(user), hash))
}

/// Whether `user` may be substituted into worker arguments and paths.
///
/// Rejects anything that could change the meaning of `{user}` in a path or
/// be taken as an option: separators, `..`, control characters, a leading `-`.
pub fn is_valid_username(user: &str) -> bool {
    !user.is_empty()
        && !user.starts_with('-')
        && user != "."
        && !user.contains("..")
        && !user.contains(['/', '\\'])
        && !user.chars().any(char::is_control)
}

/// Reduce a username to characters safe for a file name.
fn sanitize_username(user: &str) -> String {
    let mut result = String::with_capacity(32);

    for c in user.chars() {
        if result.len() >= 32 {
            break;
        }
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
            result.push(c);
        } else {
            result.push('_');
        }
    }

    if result.is_empty() {
        result.push('_');
    }
    result
}
