//! Per-user worker processes and the proxy in front of them.
//!
//! Every authenticated user is served by a dedicated child process that
//! listens on its own unix socket. The pieces:
//!
//! - [`Proc`]: one supervised worker, from spawn through readiness to a
//!   SIGTERM/SIGKILL shutdown.
//! - [`ProcStore`]: owns the user to worker table. Starts workers on demand,
//!   evicts by LRU and idleness, and bans users whose workers keep failing.
//! - [`proxy`]: single-shot HTTP/1.1 forwarding over a unix socket.
//! - [`ProcessFilter`]: the request entry point tying the above together.

mod error;
mod filter;
mod proc;
pub mod proxy;
mod store;

pub use error::{ProcError, ShutdownError, StoreError, WorkerError};
pub use filter::{Identity, IdentityHeader, ProcessFilter, identity_from_header, process_filter};
pub use proc::{ExitReport, LineKind, Proc, READY_LINE, SOCKET_ENV, Spawned, classify_line};
pub use store::{Coordinator, ProcStore};
