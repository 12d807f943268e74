//! Process store: the table of per-user workers.
//!
//! The table is owned by a single [`Coordinator`] task. Everything else talks
//! to it through a [`ProcStore`] handle, which only sends messages. The
//! coordinator multiplexes four event sources in one loop:
//!
//! - get-or-create and failure-report commands from request handlers,
//! - exit notifications from per-worker watcher tasks,
//! - a periodic tick that sweeps idle workers and expired bans,
//! - the shutdown token.
//!
//! Every read and write of `procs`, `accessed`, `failures` and `banned`
//! happens inside that loop, so admission, capacity eviction and ban checks
//! are atomic with respect to each other.
//!
//! A user's socket path is fixed, so a replacement worker is only spawned
//! once the previous worker for that user has been reaped. Gets arriving in
//! between are parked in `waiting` and answered from the exit handler.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::ProcSettings;

use super::error::{ProcError, ShutdownError, StoreError, WorkerError};
use super::proc::{ExitReport, Proc};

const COMMAND_BUFFER: usize = 256;

type GetReply = oneshot::Sender<Result<Arc<Proc>, StoreError>>;

enum Command {
    Get {
        user: String,
        reply: GetReply,
    },
    Failure {
        user: String,
        err: WorkerError,
    },
    Users {
        reply: oneshot::Sender<Vec<String>>,
    },
}

struct Exited {
    id: u64,
    user: String,
    report: Result<ExitReport, JoinError>,
}

/// Cloneable handle to the process store.
#[derive(Clone)]
pub struct ProcStore {
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
}

impl ProcStore {
    /// Create a store and the coordinator that serves it.
    ///
    /// Nothing happens until [`Coordinator::run`] is polled, usually on its
    /// own task.
    pub fn new(settings: ProcSettings) -> (Self, Coordinator) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (exits_tx, exits) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let admission = Admission::new(settings.max_failures, settings.failure_window);

        let store = Self {
            commands: commands_tx,
            shutdown: shutdown.clone(),
        };
        let coordinator = Coordinator {
            settings,
            commands,
            exits_tx,
            exits,
            shutdown,
            diagnostics: None,
            procs: HashMap::new(),
            accessed: HashMap::new(),
            admission,
            retiring: HashMap::new(),
            waiting: HashMap::new(),
            pending: HashSet::new(),
            next_id: 0,
        };
        (store, coordinator)
    }

    /// Get the worker for `user`, starting one if needed.
    pub async fn get(&self, user: &str) -> Result<Arc<Proc>, StoreError> {
        if self.shutdown.is_cancelled() {
            return Err(StoreError::Closed);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Get {
                user: user.to_string(),
                reply,
            })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Count a failure observed outside the worker (e.g. the proxy could not
    /// reach it) toward the user's ban threshold.
    pub async fn report_failure(&self, user: &str, err: WorkerError) {
        let cmd = Command::Failure {
            user: user.to_string(),
            err,
        };
        if self.commands.send(cmd).await.is_err() {
            debug!("Process store closed; dropping failure report for {}", user);
        }
    }

    /// Users that currently have a worker, sorted.
    pub async fn users(&self) -> Result<Vec<String>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Users { reply })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    /// Request shutdown of the store and every worker. Idempotent; the
    /// outcome is returned by [`Coordinator::run`].
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

struct Entry {
    id: u64,
    proc: Arc<Proc>,
}

/// Owner of the worker table. Obtain one from [`ProcStore::new`].
pub struct Coordinator {
    settings: ProcSettings,
    commands: mpsc::Receiver<Command>,
    exits_tx: mpsc::UnboundedSender<Exited>,
    exits: mpsc::UnboundedReceiver<Exited>,
    shutdown: CancellationToken,
    diagnostics: Option<mpsc::Sender<ProcError>>,
    procs: HashMap<String, Entry>,
    /// Same key set as `procs`.
    accessed: HashMap<String, Instant>,
    admission: Admission,
    /// Closed workers not yet reaped, by user. Their socket path is still
    /// taken.
    retiring: HashMap<String, u64>,
    /// Gets parked until the user's retiring worker is reaped.
    waiting: HashMap<String, Vec<GetReply>>,
    /// Workers whose exit has not been reported yet, including evicted ones
    /// still shutting down.
    pending: HashSet<u64>,
    next_id: u64,
}

impl Coordinator {
    /// Serve the store until [`ProcStore::close`] is called or every handle
    /// is dropped, then shut down all workers.
    ///
    /// Worker errors are sent to `diagnostics` when given; if the channel is
    /// full the error is dropped rather than stalling the loop.
    pub async fn run(
        mut self,
        diagnostics: Option<mpsc::Sender<ProcError>>,
    ) -> Result<(), ShutdownError> {
        self.diagnostics = diagnostics;

        let mut sweep = interval(self.settings.idle_check_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        info!(
            "Process store running (max_procs: {}, idle timeout: {:?})",
            self.settings.max_procs, self.settings.idle_timeout
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(exited) = self.exits.recv() => self.on_exit(exited, Instant::now()),
                _ = sweep.tick() => {
                    let now = Instant::now();
                    self.remove_idle(now);
                    self.admission.cleanup(now);
                }
            }
        }

        self.shutdown.cancel();
        self.shutdown_all().await
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Get { user, reply } => self.get(user, reply, Instant::now()),
            Command::Failure { user, err } => {
                self.record_failures(&user, vec![err], Instant::now());
            }
            Command::Users { reply } => {
                let mut users: Vec<String> = self.procs.keys().cloned().collect();
                users.sort();
                let _ = reply.send(users);
            }
        }
    }

    fn get(&mut self, user: String, reply: GetReply, now: Instant) {
        if let Err(e) = self.admission.check(&user, now) {
            let _ = reply.send(Err(e));
            return;
        }

        if let Some(entry) = self.procs.get(&user) {
            if !entry.proc.is_closed() {
                let proc = Arc::clone(&entry.proc);
                self.accessed.insert(user, now);
                let _ = reply.send(Ok(proc));
                return;
            }
            // Crashed, timed out or exiting; replace it.
            debug!("Worker for {} is closed, replacing", user);
            self.evict(&user);
        }

        if self.retiring.contains_key(&user) {
            debug!("Waiting for previous worker for {} to exit", user);
            self.waiting.entry(user).or_default().push(reply);
            return;
        }

        let result = self.start(&user, now);
        let _ = reply.send(result);
    }

    /// Answer gets parked for `user` once nothing holds its socket path.
    fn resume(&mut self, user: &str, now: Instant) {
        if self.retiring.contains_key(user) {
            return;
        }
        let Some(replies) = self.waiting.remove(user) else {
            return;
        };

        let result = self
            .admission
            .check(user, now)
            .and_then(|()| self.start(user, now));
        for reply in replies {
            let _ = reply.send(result.clone());
        }
    }

    /// Spawn a worker for `user`, making room first if at capacity.
    fn start(&mut self, user: &str, now: Instant) -> Result<Arc<Proc>, StoreError> {
        if self.settings.max_procs > 0 {
            while self.procs.len() >= self.settings.max_procs {
                let Some(victim) = lru_victim(&self.accessed) else {
                    break;
                };
                info!("Process limit reached, evicting worker for {}", victim);
                self.evict(&victim);
            }
        }

        let spawned = match Proc::spawn(user, &self.settings) {
            Ok(spawned) => spawned,
            Err(err) => {
                let message = err.to_string();
                error!("Failed to start worker for {}: {}", user, message);
                self.record_failures(user, vec![err], now);
                return Err(StoreError::Spawn {
                    user: user.to_string(),
                    message,
                });
            }
        };

        let id = self.next_id;
        self.next_id += 1;
        self.watch(id, user, spawned.exit);

        let proc = spawned.proc;
        self.procs.insert(
            user.to_string(),
            Entry {
                id,
                proc: Arc::clone(&proc),
            },
        );
        self.accessed.insert(user.to_string(), now);
        Ok(proc)
    }

    /// Forward the worker's exit report to the coordinator when it arrives.
    fn watch(&mut self, id: u64, user: &str, exit: JoinHandle<ExitReport>) {
        self.pending.insert(id);
        let exits = self.exits_tx.clone();
        let user = user.to_string();
        tokio::spawn(async move {
            let report = exit.await;
            let _ = exits.send(Exited { id, user, report });
        });
    }

    fn on_exit(&mut self, exited: Exited, now: Instant) {
        let Exited { id, user, report } = exited;
        self.pending.remove(&id);

        if self.procs.get(&user).is_some_and(|entry| entry.id == id) {
            info!("Worker for {} exited, removing", user);
            self.procs.remove(&user);
            self.accessed.remove(&user);
        }
        if self.retiring.get(&user) == Some(&id) {
            self.retiring.remove(&user);
        }

        let errors = match report {
            Ok(report) => report.errors,
            Err(join_err) => {
                error!("Supervisor for {} failed: {}", user, join_err);
                vec![WorkerError::Wait(io::Error::other(join_err))]
            }
        };
        if !errors.is_empty() {
            self.record_failures(&user, errors, now);
        }
        self.resume(&user, now);
    }

    /// Close and forget the user's worker, if any. Its exit is still
    /// reported later through the watcher.
    fn evict(&mut self, user: &str) {
        self.accessed.remove(user);
        if let Some(entry) = self.procs.remove(user) {
            entry.proc.close();
            self.retiring.insert(user.to_string(), entry.id);
        }
    }

    fn remove_idle(&mut self, now: Instant) {
        for (user, entry) in &self.procs {
            let served = entry.proc.last_access();
            if let Some(accessed) = self.accessed.get_mut(user) {
                if served > *accessed {
                    *accessed = served;
                }
            }
        }

        for user in idle_users(&self.accessed, now, self.settings.idle_timeout) {
            info!("Closing idle worker for {}", user);
            self.evict(&user);
        }
    }

    fn record_failures(&mut self, user: &str, errors: Vec<WorkerError>, now: Instant) {
        let count = errors.len();
        for err in errors {
            self.notify(ProcError::new(user, err));
        }

        if self.admission.record(user, count, now) {
            warn!(
                "Banning {} for {:?} after repeated worker failures",
                user, self.settings.failure_window
            );
            self.evict(user);
        }
    }

    fn notify(&self, err: ProcError) {
        debug!("Worker error: {}", err);
        if let Some(tx) = &self.diagnostics {
            if let Err(e) = tx.try_send(err) {
                debug!("Diagnostic channel unavailable, dropping: {}", e);
            }
        }
    }

    async fn shutdown_all(&mut self) -> Result<(), ShutdownError> {
        self.commands.close();
        while self.commands.try_recv().is_ok() {}
        self.waiting.clear();

        let now = Instant::now();
        while let Ok(exited) = self.exits.try_recv() {
            self.on_exit(exited, now);
        }

        let users: Vec<String> = self.procs.keys().cloned().collect();
        for user in &users {
            self.evict(user);
        }
        info!("Shutting down {} worker(s)", self.pending.len());

        let mut failed = Vec::new();
        let budget = self.settings.shutdown_timeout;
        if timeout(budget, self.collect_exits(&mut failed))
            .await
            .is_err()
        {
            error!(
                "{} worker(s) still running after {:?}",
                self.pending.len(),
                budget
            );
            return Err(ShutdownError::Timeout(budget));
        }

        if failed.is_empty() {
            info!("All workers shut down");
            Ok(())
        } else {
            failed.sort();
            failed.dedup();
            Err(ShutdownError::Cleanup(failed))
        }
    }

    async fn collect_exits(&mut self, failed: &mut Vec<String>) {
        while !self.pending.is_empty() {
            let Some(Exited { id, user, report }) = self.exits.recv().await else {
                break;
            };
            self.pending.remove(&id);

            let errors = match report {
                Ok(report) => report.errors,
                Err(join_err) => vec![WorkerError::Wait(io::Error::other(join_err))],
            };
            if !errors.is_empty() {
                failed.push(user.clone());
                for err in errors {
                    warn!("Worker for {} shut down with error: {}", user, err);
                    self.notify(ProcError::new(user.as_str(), err));
                }
            }
        }
    }
}

/// Failure accounting and temporary bans.
#[derive(Debug)]
struct Admission {
    max_failures: usize,
    window: Duration,
    failures: HashMap<String, Vec<Instant>>,
    banned: HashMap<String, Instant>,
}

impl Admission {
    fn new(max_failures: usize, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            failures: HashMap::new(),
            banned: HashMap::new(),
        }
    }

    /// Refuse banned users; lift the ban once it has expired.
    fn check(&mut self, user: &str, now: Instant) -> Result<(), StoreError> {
        if self.is_banned(user, now) {
            return Err(StoreError::Banned(user.to_string()));
        }
        if self.banned.remove(user).is_some() {
            info!("Ban for {} expired", user);
        }
        Ok(())
    }

    /// Record `count` failures at `now`. Returns true if this bans the user.
    ///
    /// Entries older than the window are pruned first; the user is banned
    /// when the remaining count strictly exceeds `max_failures`.
    fn record(&mut self, user: &str, count: usize, now: Instant) -> bool {
        if count == 0 {
            return false;
        }
        let window = self.window;
        let failures = self.failures.entry(user.to_string()).or_default();
        failures.retain(|t| now.saturating_duration_since(*t) < window);
        failures.extend(std::iter::repeat_n(now, count));

        if failures.len() > self.max_failures {
            self.failures.remove(user);
            self.banned.insert(user.to_string(), now + window);
            true
        } else {
            false
        }
    }

    fn is_banned(&self, user: &str, now: Instant) -> bool {
        self.banned.get(user).is_some_and(|until| now < *until)
    }

    /// Drop stale failure timestamps and expired bans.
    fn cleanup(&mut self, now: Instant) {
        let window = self.window;
        self.failures.retain(|_, failures| {
            failures.retain(|t| now.saturating_duration_since(*t) < window);
            !failures.is_empty()
        });
        self.banned.retain(|user, until| {
            let active = now < *until;
            if !active {
                info!("Ban for {} expired", user);
            }
            active
        });
    }
}

/// The least recently accessed user.
fn lru_victim(accessed: &HashMap<String, Instant>) -> Option<String> {
    accessed
        .iter()
        .min_by_key(|(_, at)| **at)
        .map(|(user, _)| user.clone())
}

/// Users whose last access is more than `idle_timeout` before `now`.
fn idle_users(
    accessed: &HashMap<String, Instant>,
    now: Instant,
    idle_timeout: Duration,
) -> Vec<String> {
    accessed
        .iter()
        .filter(|(_, at)| now.saturating_duration_since(**at) > idle_timeout)
        .map(|(user, _)| user.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const SECOND: Duration = Duration::from_secs(1);

    fn sh_settings(script: &str, dir: &Path) -> ProcSettings {
        let mut settings = ProcSettings::new("/bin/sh", dir);
        settings.args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
        settings.startup_timeout = Duration::from_secs(5);
        settings.exit_timeout = Duration::from_secs(2);
        settings.shutdown_timeout = Duration::from_secs(10);
        settings
    }

    fn start(settings: ProcSettings) -> (ProcStore, JoinHandle<Result<(), ShutdownError>>) {
        let (store, coordinator) = ProcStore::new(settings);
        let handle = tokio::spawn(coordinator.run(None));
        (store, handle)
    }

    const WORKER: &str = "echo ready; exec sleep 30";

    #[test]
    fn test_ban_requires_exceeding_max_failures() {
        let start = Instant::now();
        let mut admission = Admission::new(3, Duration::from_secs(60));

        assert!(!admission.record("carol", 1, start));
        assert!(!admission.record("carol", 1, start + SECOND));
        assert!(!admission.record("carol", 1, start + 2 * SECOND));
        assert!(admission.check("carol", start + 2 * SECOND).is_ok());

        assert!(admission.record("carol", 1, start + 3 * SECOND));
        assert!(admission.failures.get("carol").is_none());
        assert!(matches!(
            admission.check("carol", start + 4 * SECOND),
            Err(StoreError::Banned(_))
        ));
    }

    #[test]
    fn test_ban_expires_after_window() {
        let start = Instant::now();
        let mut admission = Admission::new(1, Duration::from_secs(60));

        assert!(admission.record("carol", 2, start));
        assert!(admission.is_banned("carol", start + 59 * SECOND));
        assert!(admission.check("carol", start + 59 * SECOND).is_err());

        assert!(admission.check("carol", start + 60 * SECOND).is_ok());
        assert!(!admission.is_banned("carol", start + 60 * SECOND));
        assert!(admission.banned.is_empty());
    }

    #[test]
    fn test_old_failures_are_pruned_before_counting() {
        let start = Instant::now();
        let mut admission = Admission::new(3, Duration::from_secs(10));

        assert!(!admission.record("dave", 3, start));
        // The first three have aged out, so two fresh ones stay below the limit.
        assert!(!admission.record("dave", 2, start + 11 * SECOND));
        assert_eq!(admission.failures["dave"].len(), 2);
        assert!(!admission.is_banned("dave", start + 11 * SECOND));
    }

    #[test]
    fn test_failures_are_per_user() {
        let start = Instant::now();
        let mut admission = Admission::new(2, Duration::from_secs(60));

        assert!(!admission.record("alice", 2, start));
        assert!(!admission.record("bob", 2, start));
        assert!(admission.record("alice", 1, start));
        assert!(admission.is_banned("alice", start));
        assert!(!admission.is_banned("bob", start));
    }

    #[test]
    fn test_cleanup_prunes_failures_and_bans() {
        let start = Instant::now();
        let mut admission = Admission::new(1, Duration::from_secs(10));

        admission.record("alice", 1, start);
        admission.record("bob", 2, start);
        assert!(admission.is_banned("bob", start));

        admission.cleanup(start + 5 * SECOND);
        assert!(admission.failures.contains_key("alice"));
        assert!(admission.banned.contains_key("bob"));

        admission.cleanup(start + 10 * SECOND);
        assert!(admission.failures.is_empty());
        assert!(admission.banned.is_empty());
    }

    #[test]
    fn test_lru_victim_picks_oldest_access() {
        let start = Instant::now();
        let mut accessed = HashMap::new();
        accessed.insert("alice".to_string(), start + 2 * SECOND);
        accessed.insert("bob".to_string(), start);
        accessed.insert("carol".to_string(), start + SECOND);

        assert_eq!(lru_victim(&accessed).as_deref(), Some("bob"));
        assert_eq!(lru_victim(&HashMap::new()), None);
    }

    #[test]
    fn test_idle_users() {
        let start = Instant::now();
        let mut accessed = HashMap::new();
        accessed.insert("alice".to_string(), start);
        accessed.insert("bob".to_string(), start + 5 * SECOND);

        let now = start + 11 * SECOND;
        assert_eq!(
            idle_users(&accessed, now, Duration::from_secs(10)),
            vec!["alice".to_string()]
        );
        assert!(idle_users(&accessed, start + 10 * SECOND, Duration::from_secs(10)).is_empty());
    }

    #[tokio::test]
    async fn test_get_reuses_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (store, handle) = start(sh_settings(WORKER, dir.path()));

        let first = store.get("alice").await.unwrap();
        first.serve().await.unwrap();
        let second = store.get("alice").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.users().await.unwrap(), vec!["alice"]);

        store.close();
        handle.await.unwrap().unwrap();
        assert!(first.has_exited());
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (store, handle) = start(sh_settings(WORKER, dir.path()));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get("alice").await.unwrap() })
            })
            .collect();

        let mut procs = Vec::new();
        for task in tasks {
            procs.push(task.await.unwrap());
        }
        assert!(procs.iter().all(|p| Arc::ptr_eq(p, &procs[0])));
        assert_eq!(store.users().await.unwrap(), vec!["alice"]);

        store.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = sh_settings(WORKER, dir.path());
        settings.max_procs = 2;
        let (store, handle) = start(settings);

        let alice = store.get("alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let bob = store.get("bob").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.get("alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let carol = store.get("carol").await.unwrap();
        assert_eq!(store.users().await.unwrap(), vec!["alice", "carol"]);
        assert!(bob.is_closed());
        assert!(!alice.is_closed());
        carol.serve().await.unwrap();

        store.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_single_slot_replaces_previous_user() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = sh_settings(WORKER, dir.path());
        settings.max_procs = 1;
        let (store, handle) = start(settings);

        let alice = store.get("alice").await.unwrap();
        alice.serve().await.unwrap();
        let bob = store.get("bob").await.unwrap();

        assert_eq!(store.users().await.unwrap(), vec!["bob"]);
        alice.wait().await;
        assert!(alice.has_exited());
        bob.serve().await.unwrap();

        store.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_replacement_waits_for_previous_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = sh_settings(
            "trap 'sleep 0.5; exit 0' TERM; touch \"$WARDEN_SOCKET\"; echo ready; \
             while :; do sleep 0.05; done",
            dir.path(),
        );
        settings.max_procs = 1;
        let socket = settings.socket_path("alice");
        let (store, handle) = start(settings);

        let first = store.get("alice").await.unwrap();
        first.serve().await.unwrap();
        store.get("bob").await.unwrap();
        assert!(first.is_closed());

        // Parked until the old worker has released the socket path.
        let second = store.get("alice").await.unwrap();
        assert!(first.has_exited());
        assert!(!Arc::ptr_eq(&first, &second));

        second.serve().await.unwrap();
        assert!(!second.is_closed());
        assert!(socket.exists());
        assert_eq!(store.users().await.unwrap(), vec!["alice"]);

        store.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_worker_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("crashed");
        // Crashes once, leaving a grandchild holding its stdout open.
        let script = format!(
            "if [ -e '{m}' ]; then echo ready; exec sleep 30; fi; touch '{m}'; \
             sleep 1 & echo ready; sleep 0.1; exit 1",
            m = marker.display()
        );
        let (store, handle) = start(sh_settings(&script, dir.path()));

        let first = store.get("alice").await.unwrap();
        first.serve().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(first.is_closed());
        assert!(matches!(first.serve().await, Err(WorkerError::Closed)));

        let second = store.get("alice").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.has_exited());
        second.serve().await.unwrap();
        assert!(Arc::ptr_eq(&second, &store.get("alice").await.unwrap()));

        store.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_username_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (store, handle) = start(sh_settings(WORKER, dir.path()));

        assert!(matches!(
            store.get("../etc").await,
            Err(StoreError::Spawn { user, .. }) if user == "../etc"
        ));
        assert!(store.users().await.unwrap().is_empty());

        store.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_worker_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = sh_settings(WORKER, dir.path());
        settings.idle_timeout = Duration::from_millis(300);
        settings.idle_check_period = Duration::from_millis(50);
        let (store, handle) = start(settings);

        let first = store.get("alice").await.unwrap();
        first.serve().await.unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(store.users().await.unwrap().is_empty());
        assert!(first.is_closed());

        let second = store.get("alice").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        second.serve().await.unwrap();

        store.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reported_failures_ban_user() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = sh_settings(WORKER, dir.path());
        settings.max_failures = 3;
        settings.failure_window = Duration::from_secs(60);
        let (store, handle) = start(settings);

        let worker = store.get("carol").await.unwrap();
        for _ in 0..3 {
            store
                .report_failure("carol", WorkerError::Dial("refused".to_string()))
                .await;
        }
        assert!(Arc::ptr_eq(&worker, &store.get("carol").await.unwrap()));

        store
            .report_failure("carol", WorkerError::Dial("refused".to_string()))
            .await;
        assert!(matches!(
            store.get("carol").await,
            Err(StoreError::Banned(user)) if user == "carol"
        ));
        assert!(worker.is_closed());
        assert!(store.users().await.unwrap().is_empty());

        // Other users are unaffected.
        store.get("alice").await.unwrap();

        store.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ban_lifts_after_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = sh_settings(WORKER, dir.path());
        settings.max_failures = 1;
        settings.failure_window = Duration::from_millis(300);
        let (store, handle) = start(settings);

        for _ in 0..2 {
            store
                .report_failure("carol", WorkerError::Dial("refused".to_string()))
                .await;
        }
        assert!(matches!(
            store.get("carol").await,
            Err(StoreError::Banned(_))
        ));

        tokio::time::sleep(Duration::from_millis(400)).await;
        store.get("carol").await.unwrap().serve().await.unwrap();

        store.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let settings = sh_settings("echo ready; sleep 0.2; exit 1", dir.path());
        let (store, coordinator) = ProcStore::new(settings);
        let (diag_tx, mut diag_rx) = mpsc::channel(8);
        let handle = tokio::spawn(coordinator.run(Some(diag_tx)));

        let worker = store.get("alice").await.unwrap();
        worker.serve().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), diag_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err.user, "alice");
        assert!(matches!(err.err, WorkerError::UnexpectedExit(_)));
        assert!(!err.is_fatal());
        assert!(store.users().await.unwrap().is_empty());

        store.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (store, handle) = start(ProcSettings::new("/nonexistent/worker", dir.path()));

        assert!(matches!(
            store.get("alice").await,
            Err(StoreError::Spawn { user, .. }) if user == "alice"
        ));
        assert!(store.users().await.unwrap().is_empty());

        store.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_store_rejects_gets() {
        let dir = tempfile::tempdir().unwrap();
        let (store, handle) = start(sh_settings(WORKER, dir.path()));

        let alice = store.get("alice").await.unwrap();
        let bob = store.get("bob").await.unwrap();

        store.close();
        store.close();
        handle.await.unwrap().unwrap();

        assert!(alice.has_exited());
        assert!(bob.has_exited());
        assert!(store.is_closed());
        assert!(matches!(store.get("alice").await, Err(StoreError::Closed)));
        assert!(matches!(store.users().await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = sh_settings("trap '' TERM; echo ready; exec sleep 30", dir.path());
        settings.exit_timeout = Duration::from_secs(5);
        settings.shutdown_timeout = Duration::from_millis(300);
        let (store, handle) = start(settings);

        store.get("alice").await.unwrap().serve().await.unwrap();
        store.close();

        assert!(matches!(
            handle.await.unwrap(),
            Err(ShutdownError::Timeout(limit)) if limit == Duration::from_millis(300)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_reports_unclean_workers() {
        let dir = tempfile::tempdir().unwrap();
        // The background sleep keeps the output pipes open past exit.
        let mut settings = sh_settings("sleep 5 & echo ready; exec sleep 30", dir.path());
        settings.exit_timeout = Duration::from_millis(300);
        let (store, handle) = start(settings);

        store.get("alice").await.unwrap().serve().await.unwrap();
        store.get("bob").await.unwrap().serve().await.unwrap();
        store.close();

        match handle.await.unwrap() {
            Err(ShutdownError::Cleanup(users)) => assert_eq!(users, vec!["alice", "bob"]),
            other => panic!("unexpected shutdown result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_full_diagnostics_channel_does_not_stall() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = sh_settings(WORKER, dir.path());
        settings.max_failures = 100;
        let (store, coordinator) = ProcStore::new(settings);
        let (diag_tx, mut diag_rx) = mpsc::channel(1);
        let handle = tokio::spawn(coordinator.run(Some(diag_tx)));

        for i in 0..20 {
            store
                .report_failure(&format!("user{i}"), WorkerError::Dial("refused".to_string()))
                .await;
        }

        let worker = tokio::time::timeout(Duration::from_secs(2), store.get("alice"))
            .await
            .unwrap()
            .unwrap();
        worker.serve().await.unwrap();

        assert_eq!(diag_rx.try_recv().unwrap().user, "user0");
        assert!(diag_rx.try_recv().is_err());

        store.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropping_all_handles_stops_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let (store, handle) = start(sh_settings(WORKER, dir.path()));

        let alice = store.get("alice").await.unwrap();
        drop(store);

        handle.await.unwrap().unwrap();
        assert!(alice.has_exited());
    }
}
