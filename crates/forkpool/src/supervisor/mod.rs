//! Supervisor lifecycle
//!
//! ```text
//! Starting -> Daemonizing -> InstanceAcquired -> BlockingLoop    -> Terminating -> Exited
//!                                             \-> NonBlockingLoop -/
//! ```
//!
//! # Fork Safety
//!
//! The supervisor forks both to detach and to start every worker. It must
//! run in a single-threaded process: no async runtime, no background
//! threads. Children only run the worker and then `_exit`.
//!
//! # Exits
//!
//! Nothing in here calls `std::process::exit`. Every terminal state is
//! reported through [`Outcome`] and the caller decides on the status code
//! (the CLI exits 0 for all of them).

mod admission;

use crate::config::DaemonConfig;
use crate::error::{ForkpoolError, Result};
use crate::instance::{semaphore_key, Acquisition, InstanceGuard, InstanceLock, LockRelease};
use crate::log::{Level, LogSink, Syslog};
use crate::semaphore::AdmissionSemaphore;
use crate::signals::{DispatchTable, SignalEvent, SignalRouter};
use crate::worker::{WorkerExecutor, WorkerTable};
use nix::unistd::{fork, getpid, setsid, ForkResult, Pid};
use tracing::{debug, info};

/// Where the supervisor is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Daemonizing,
    InstanceAcquired,
    BlockingLoop,
    NonBlockingLoop,
    Terminating,
    Exited,
}

/// How a call to [`Supervisor::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// This is the launching process; the daemon continues as `daemon_pid`.
    Detached { daemon_pid: Pid },
    /// Another live supervisor owns the pid file. Nothing was changed.
    AlreadyRunning { pid: Pid },
    /// A teardown signal arrived and resources were released.
    Terminated { signal: SignalEvent },
}

/// Result of [`Supervisor::startup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    /// Lock and semaphore are held; the admission loop may start.
    Ready,
    /// Another instance is live.
    AlreadyRunning { pid: Pid },
}

/// Runs a worker in a semaphore-bounded pool of child processes.
pub struct Supervisor<W: WorkerExecutor> {
    config: DaemonConfig,
    worker: W,
    router: SignalRouter,
    // Opened on first use unless replaced through `with_sink`
    sink: Option<Box<dyn LogSink>>,
    state: SupervisorState,
    pid: Pid,
    lock: Option<InstanceLock>,
    semaphore: Option<AdmissionSemaphore>,
    children: WorkerTable,
}

impl<W: WorkerExecutor> Supervisor<W> {
    /// Supervisor with the standard dispatch table and the system log as its
    /// sink. The log is only opened once there is something to report.
    pub fn new(config: DaemonConfig, worker: W) -> Self {
        Self {
            config,
            worker,
            router: SignalRouter::new(DispatchTable::standard()),
            sink: None,
            state: SupervisorState::Starting,
            pid: getpid(),
            lock: None,
            semaphore: None,
            children: WorkerTable::new(),
        }
    }

    /// Replace the signal router.
    #[must_use]
    pub fn with_router(mut self, router: SignalRouter) -> Self {
        self.router = router;
        self
    }

    /// Replace the log sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Box<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn emit(&mut self, level: Level, message: &str) {
        self.sink
            .get_or_insert_with(|| Box::new(Syslog::open(self.config.name())))
            .emit(level, message);
    }

    #[must_use]
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    #[must_use]
    pub fn router(&self) -> &SignalRouter {
        &self.router
    }

    /// Pid of the supervising process (the daemon after detaching)
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn semaphore(&self) -> Option<&AdmissionSemaphore> {
        self.semaphore.as_ref()
    }

    /// Forked children that have not been reaped yet
    #[must_use]
    pub fn live_children(&self) -> usize {
        self.children.len()
    }

    /// Run until a teardown signal arrives.
    ///
    /// # Errors
    /// Any fatal startup or admission failure. Resources acquired before the
    /// failure are released first.
    pub fn run(&mut self) -> Result<Outcome> {
        self.run_with(|| {})
    }

    /// Like [`Supervisor::run`], calling `before_detach` in the launching
    /// process right before it hands over to the daemon.
    ///
    /// # Errors
    /// See [`Supervisor::run`].
    pub fn run_with<F: FnOnce()>(&mut self, before_detach: F) -> Result<Outcome> {
        self.router.install()?;

        if self.config.daemonize() {
            if let Some(daemon_pid) = self.daemonize()? {
                before_detach();
                return Ok(Outcome::Detached { daemon_pid });
            }
        }

        if let Startup::AlreadyRunning { pid } = self.startup()? {
            return Ok(Outcome::AlreadyRunning { pid });
        }

        match self.admission_loop() {
            Ok(signal) => {
                info!("Received {:?}, shutting down", signal);
                self.destroy();
                Ok(Outcome::Terminated { signal })
            }
            Err(e) => {
                self.emit(Level::Error, &e.to_string());
                self.destroy();
                Err(e)
            }
        }
    }

    /// Fork and detach. Returns the daemon pid in the launching process and
    /// `None` in the daemon.
    fn daemonize(&mut self) -> Result<Option<Pid>> {
        self.state = SupervisorState::Daemonizing;

        // SAFETY: the supervisor runs single-threaded (see module docs).
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                debug!("Detached, daemon continues as {}", child);
                self.state = SupervisorState::Exited;
                Ok(Some(child))
            }
            Ok(ForkResult::Child) => {
                setsid().map_err(|e| {
                    ForkpoolError::Daemonize(format!("Could not set to session leader: {e}"))
                })?;
                Ok(None)
            }
            Err(e) => Err(ForkpoolError::Daemonize(format!("Could not fork: {e}"))),
        }
    }

    /// Take the instance lock and open the semaphore.
    ///
    /// If the semaphore cannot be opened the pid file just written is
    /// removed again before the error is returned.
    ///
    /// # Errors
    /// Pid file or semaphore failures (see [`InstanceGuard::acquire`] and
    /// [`AdmissionSemaphore::open`]).
    pub fn startup(&mut self) -> Result<Startup> {
        self.pid = getpid();

        let lock = match InstanceGuard::new(self.config.pid_file()).acquire(self.pid)? {
            Acquisition::Acquired(lock) => lock,
            Acquisition::AlreadyRunning { pid } => {
                info!(
                    "{} already running as {}",
                    self.config.pid_file().display(),
                    pid
                );
                self.state = SupervisorState::Exited;
                return Ok(Startup::AlreadyRunning { pid });
            }
        };

        let semaphore = semaphore_key(lock.path())
            .and_then(|key| AdmissionSemaphore::open(key, self.config.pool_size()));
        let semaphore = match semaphore {
            Ok(semaphore) => semaphore,
            Err(e) => {
                if let Err(release_err) = lock.release() {
                    self.emit(Level::Error, &release_err.to_string());
                }
                return Err(e);
            }
        };

        info!(
            "Supervisor {} ready: pool {} ({}), semaphore key {:#x}",
            self.pid,
            self.config.pool_size(),
            self.config.mode(),
            semaphore.key()
        );
        self.lock = Some(lock);
        self.semaphore = Some(semaphore);
        self.state = SupervisorState::InstanceAcquired;
        Ok(Startup::Ready)
    }

    /// Release the semaphore and the pid file.
    ///
    /// Failures are reported to the sink and otherwise ignored. Calling this
    /// again after it has run does nothing. Children already running are
    /// left alone.
    pub fn destroy(&mut self) {
        if self.state == SupervisorState::Exited {
            return;
        }
        self.state = SupervisorState::Terminating;

        if let Some(mut semaphore) = self.semaphore.take() {
            match semaphore.destroy() {
                Ok(()) => debug!("Removed semaphore {:#x}", semaphore.key()),
                Err(e) => self.emit(Level::Warning, &e.to_string()),
            }
        }

        if let Some(lock) = self.lock.take() {
            match lock.release() {
                Ok(LockRelease::Removed) => {
                    debug!("Removed pid file {}", lock.path().display());
                }
                Ok(LockRelease::NotOwner(owner)) => {
                    info!(
                        "Pid file {} belongs to {:?}, left in place",
                        lock.path().display(),
                        owner
                    );
                }
                Ok(LockRelease::Missing) => {
                    let message = format!("Pid file [{}] already gone", lock.path().display());
                    self.emit(Level::Warning, &message);
                }
                Err(e) => self.emit(Level::Warning, &e.to_string()),
            }
        }

        if !self.children.is_empty() {
            info!(
                "Leaving {} running children ({} holding a slot)",
                self.children.len(),
                self.children.held()
            );
        }
        self.state = SupervisorState::Exited;
    }
}

impl<W: WorkerExecutor> std::fmt::Debug for Supervisor<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("lock", &self.lock)
            .field("semaphore", &self.semaphore)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::AdmissionMode;
    use crate::instance::{read_pid, write_pid};
    use crate::signals::PendingSignals;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<(Level, String)>>>);

    impl LogSink for Capture {
        fn emit(&self, level: Level, message: &str) {
            self.0.lock().unwrap().push((level, message.to_string()));
        }
    }

    impl Capture {
        fn lines(&self) -> Vec<(Level, String)> {
            self.0.lock().unwrap().clone()
        }
    }

    fn config(pid_file: &Path, mode: AdmissionMode) -> DaemonConfig {
        DaemonConfig::builder("forkpool-test")
            .daemonize(false)
            .mode(mode)
            .pool_size(2)
            .pid_file(pid_file)
            .build()
            .unwrap()
    }

    fn supervisor(
        pid_file: &Path,
        mode: AdmissionMode,
        pending: &'static PendingSignals,
    ) -> (Supervisor<fn() -> i32>, Capture) {
        let capture = Capture::default();
        let router = SignalRouter::detached(DispatchTable::standard(), pending);
        let worker: fn() -> i32 = || 0;
        let sup = Supervisor::new(config(pid_file, mode), worker)
            .with_router(router)
            .with_sink(Box::new(capture.clone()));
        (sup, capture)
    }

    fn pid_path() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sup.pid");
        (dir, path)
    }

    #[test]
    fn test_startup_acquires_lock_and_semaphore() {
        static PENDING: PendingSignals = PendingSignals::new();
        let (_dir, path) = pid_path();
        let (mut sup, _) = supervisor(&path, AdmissionMode::NonBlocking, &PENDING);

        assert_eq!(sup.startup().unwrap(), Startup::Ready);
        assert_eq!(sup.state(), SupervisorState::InstanceAcquired);
        assert_eq!(read_pid(&path).unwrap(), Some(getpid()));
        assert_eq!(sup.semaphore().unwrap().count().unwrap(), 2);

        sup.destroy();
    }

    #[test]
    fn test_second_instance_changes_nothing() {
        static PENDING: PendingSignals = PendingSignals::new();
        let (_dir, path) = pid_path();
        let (mut first, _) = supervisor(&path, AdmissionMode::NonBlocking, &PENDING);
        let (mut second, _) = supervisor(&path, AdmissionMode::NonBlocking, &PENDING);

        assert_eq!(first.startup().unwrap(), Startup::Ready);
        let key = first.semaphore().unwrap().key();
        first.semaphore().unwrap().acquire(false);

        assert_eq!(
            second.startup().unwrap(),
            Startup::AlreadyRunning { pid: getpid() }
        );
        assert!(second.semaphore().is_none());
        assert_eq!(second.state(), SupervisorState::Exited);

        // The live instance's count was not reset by the second start
        assert_eq!(first.semaphore().unwrap().count().unwrap(), 1);
        assert_eq!(first.semaphore().unwrap().key(), key);
        assert_eq!(read_pid(&path).unwrap(), Some(getpid()));

        first.destroy();
    }

    #[test]
    fn test_terminate_signal_tears_down() {
        static PENDING: PendingSignals = PendingSignals::new();
        let (_dir, path) = pid_path();
        let (mut sup, capture) = supervisor(&path, AdmissionMode::NonBlocking, &PENDING);

        sup.router().notify(SignalEvent::Terminate);
        let outcome = sup.run().unwrap();

        assert_eq!(
            outcome,
            Outcome::Terminated {
                signal: SignalEvent::Terminate
            }
        );
        assert_eq!(sup.state(), SupervisorState::Exited);
        assert!(sup.semaphore().is_none());
        assert!(!path.exists());
        assert_eq!(sup.live_children(), 0);
        assert!(capture.lines().is_empty());
    }

    #[test]
    fn test_blocking_mode_tears_down_on_quit() {
        static PENDING: PendingSignals = PendingSignals::new();
        let (_dir, path) = pid_path();
        let (mut sup, _) = supervisor(&path, AdmissionMode::Blocking, &PENDING);

        sup.router().notify(SignalEvent::Quit);
        assert_eq!(
            sup.run().unwrap(),
            Outcome::Terminated {
                signal: SignalEvent::Quit
            }
        );
        assert!(!path.exists());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        static PENDING: PendingSignals = PendingSignals::new();
        let (_dir, path) = pid_path();
        let (mut sup, capture) = supervisor(&path, AdmissionMode::NonBlocking, &PENDING);
        sup.startup().unwrap();

        sup.destroy();
        sup.destroy();

        assert_eq!(sup.state(), SupervisorState::Exited);
        assert!(!path.exists());
        assert!(capture.lines().is_empty());
    }

    #[test]
    fn test_destroy_keeps_foreign_pid_file() {
        static PENDING: PendingSignals = PendingSignals::new();
        let (_dir, path) = pid_path();
        let (mut sup, _) = supervisor(&path, AdmissionMode::NonBlocking, &PENDING);
        sup.startup().unwrap();

        std::fs::remove_file(&path).unwrap();
        write_pid(&path, Pid::from_raw(1)).unwrap();
        sup.destroy();

        assert_eq!(read_pid(&path).unwrap(), Some(Pid::from_raw(1)));
    }

    #[test]
    fn test_destroy_warns_about_missing_resources() {
        static PENDING: PendingSignals = PendingSignals::new();
        let (_dir, path) = pid_path();
        let (mut sup, capture) = supervisor(&path, AdmissionMode::NonBlocking, &PENDING);
        sup.startup().unwrap();

        std::fs::remove_file(&path).unwrap();
        let key = sup.semaphore().unwrap().key();
        AdmissionSemaphore::open(key, 1).unwrap().destroy().unwrap();

        sup.destroy();

        let lines = capture.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|(level, _)| *level == Level::Warning));
        assert!(lines[0].1.contains("Remove semaphore failure"));
        assert!(lines[1].1.contains("already gone"));
    }

    #[test]
    fn test_stale_pid_file_is_replaced() {
        static PENDING: PendingSignals = PendingSignals::new();
        let (_dir, path) = pid_path();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let stale = Pid::from_raw(child.id() as i32);
        child.wait().unwrap();
        write_pid(&path, stale).unwrap();

        let (mut sup, _) = supervisor(&path, AdmissionMode::NonBlocking, &PENDING);
        assert_eq!(sup.startup().unwrap(), Startup::Ready);
        assert_eq!(read_pid(&path).unwrap(), Some(getpid()));
        assert!(sup.semaphore().is_some());
        sup.destroy();
    }

    #[test]
    fn test_system_log_opened_only_when_needed() {
        static PENDING: PendingSignals = PendingSignals::new();
        let (_dir, path) = pid_path();
        let worker: fn() -> i32 = || 0;
        let plain = Supervisor::new(config(&path, AdmissionMode::NonBlocking), worker);
        assert!(plain.sink.is_none());

        let (mut sup, capture) = supervisor(&path, AdmissionMode::NonBlocking, &PENDING);
        sup.emit(Level::Warning, "routed");
        assert_eq!(capture.lines(), vec![(Level::Warning, "routed".to_string())]);
    }

    #[test]
    fn test_startup_failure_removes_nothing_it_did_not_create() {
        static PENDING: PendingSignals = PendingSignals::new();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent").join("sup.pid");
        let (mut sup, _) = supervisor(&path, AdmissionMode::NonBlocking, &PENDING);

        assert!(matches!(
            sup.startup(),
            Err(ForkpoolError::PidFileCreate { .. })
        ));
        assert!(sup.semaphore().is_none());
    }
}
