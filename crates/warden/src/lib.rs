//! Per-user worker pool and unix-socket proxy for the warden file daemon.

pub mod config;
pub mod procs;
pub mod server;
pub mod worker;
