//! forkpool - Daemon supervisor with a semaphore-bounded process pool
//!
//! This library runs a program as a long-lived background process and fans
//! work out to child processes. Concurrency is bounded by a System V
//! counting semaphore rather than an in-process scheduler, and a pid file
//! keeps the supervisor a singleton per identity.
//!
//! # Example
//!
//! ```no_run
//! use forkpool::{DaemonConfig, Outcome, Supervisor};
//!
//! fn main() -> forkpool::Result<()> {
//!     let config = DaemonConfig::builder("mydaemon")
//!         .pool_size(4)
//!         .pid_file("/tmp/mydaemon.pid")
//!         .build()?;
//!
//!     // Runs once in every forked child; the return value is its exit status
//!     let worker = || {
//!         std::thread::sleep(std::time::Duration::from_secs(1));
//!         0
//!     };
//!
//!     match Supervisor::new(config, worker).run()? {
//!         Outcome::Detached { daemon_pid } => println!("started as {daemon_pid}"),
//!         Outcome::AlreadyRunning { pid } => println!("already running as {pid}"),
//!         Outcome::Terminated { .. } => {}
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Platform Support
//!
//! Unix only: relies on `fork(2)`, `setsid(2)` and System V semaphores.

pub mod config;
pub mod error;
pub mod instance;
pub mod log;
pub mod semaphore;
pub mod signals;
pub mod supervisor;
pub mod worker;

// Re-exports for convenience
pub use config::{AdmissionMode, DaemonConfig, DaemonConfigBuilder};
pub use error::{ForkpoolError, Result};
pub use instance::{Acquisition, InstanceGuard, InstanceLock, InstanceStatus, LockRelease};
pub use log::{Level, LogSink, Syslog, TracingSink};
pub use semaphore::{Admission, AdmissionSemaphore};
pub use signals::{DispatchTable, PendingSignals, Route, SignalEvent, SignalRouter};
pub use supervisor::{Outcome, Startup, Supervisor, SupervisorState};
pub use worker::{supervisor_terminated, WorkerExecutor, WorkerProcess};
