//! Supervisor configuration
//!
//! The option set is small and fixed: detach or not, how admission waits for
//! a free slot, how many children may run at once, and which pid file names
//! the instance. Everything has a default so `DaemonConfig::builder(name)`
//! followed by `build()` yields a usable configuration.

use crate::error::{ForkpoolError, Result};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

/// Default number of concurrently running children
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Largest value a System V semaphore may hold (SEMVMX)
pub const MAX_POOL_SIZE: u32 = 32_767;

/// Directory holding pid files when no explicit path is given
pub const DEFAULT_PID_DIR: &str = "/var/run";

/// How the admission loop waits for a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionMode {
    /// Suspend in the kernel until a slot frees up.
    /// Children release their own slot before exiting; the supervisor
    /// reaps them and settles any slot a child failed to return.
    Blocking,

    /// Poll the semaphore and reap exited children between attempts.
    /// Keeps the supervisor responsive to signals while every slot is
    /// held by a long-running child.
    #[default]
    NonBlocking,
}

impl AdmissionMode {
    /// Mode selected by a plain `blocking` flag.
    #[must_use]
    pub fn from_blocking(blocking: bool) -> Self {
        if blocking {
            AdmissionMode::Blocking
        } else {
            AdmissionMode::NonBlocking
        }
    }

    #[must_use]
    pub fn is_blocking(self) -> bool {
        matches!(self, AdmissionMode::Blocking)
    }
}

impl std::fmt::Display for AdmissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionMode::Blocking => write!(f, "blocking"),
            AdmissionMode::NonBlocking => write!(f, "non-blocking"),
        }
    }
}

/// Immutable supervisor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    name: String,
    daemonize: bool,
    mode: AdmissionMode,
    pool_size: NonZeroU32,
    pid_file: PathBuf,
}

impl DaemonConfig {
    /// Start a builder for an instance called `name`.
    ///
    /// The name picks the default pid file path (`/var/run/<name>.pid`)
    /// and tags system log messages.
    pub fn builder(name: &str) -> DaemonConfigBuilder {
        DaemonConfigBuilder::new(name)
    }

    /// Instance name, used as the system log tag
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `run()` detaches from the controlling terminal
    #[must_use]
    pub fn daemonize(&self) -> bool {
        self.daemonize
    }

    #[must_use]
    pub fn mode(&self) -> AdmissionMode {
        self.mode
    }

    /// Maximum number of concurrently alive children
    #[must_use]
    pub fn pool_size(&self) -> u32 {
        self.pool_size.get()
    }

    /// Pid file naming this instance; also the semaphore key source
    #[must_use]
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }
}

/// Builder for [`DaemonConfig`].
#[derive(Debug, Clone)]
pub struct DaemonConfigBuilder {
    name: String,
    daemonize: bool,
    mode: AdmissionMode,
    pool_size: u32,
    pid_file: PathBuf,
}

impl DaemonConfigBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            daemonize: true,
            mode: AdmissionMode::default(),
            pool_size: DEFAULT_POOL_SIZE,
            pid_file: default_pid_file(name),
        }
    }

    #[must_use]
    pub fn daemonize(mut self, daemonize: bool) -> Self {
        self.daemonize = daemonize;
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: AdmissionMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn blocking(self, blocking: bool) -> Self {
        self.mode(AdmissionMode::from_blocking(blocking))
    }

    #[must_use]
    pub fn pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    #[must_use]
    pub fn pid_file(mut self, pid_file: impl Into<PathBuf>) -> Self {
        self.pid_file = pid_file.into();
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for a zero pool size, an empty name or pid file path,
    /// or a pid file path that names a directory.
    pub fn build(self) -> Result<DaemonConfig> {
        let pool_size = NonZeroU32::new(self.pool_size).ok_or_else(|| {
            ForkpoolError::InvalidConfig("pool size must be greater than zero".to_string())
        })?;

        if pool_size.get() > MAX_POOL_SIZE {
            return Err(ForkpoolError::InvalidConfig(format!(
                "pool size {pool_size} exceeds the semaphore maximum of {MAX_POOL_SIZE}"
            )));
        }

        if self.name.is_empty() {
            return Err(ForkpoolError::InvalidConfig(
                "instance name must not be empty".to_string(),
            ));
        }
        if self.pid_file.as_os_str().is_empty() {
            return Err(ForkpoolError::InvalidConfig(
                "pid file path must not be empty".to_string(),
            ));
        }
        if self.pid_file.is_dir() {
            return Err(ForkpoolError::InvalidConfig(format!(
                "pid file path {} is a directory",
                self.pid_file.display()
            )));
        }

        Ok(DaemonConfig {
            name: self.name,
            daemonize: self.daemonize,
            mode: self.mode,
            pool_size,
            pid_file: self.pid_file,
        })
    }
}

/// `/var/run/<name>.pid`
#[must_use]
pub fn default_pid_file(name: &str) -> PathBuf {
    Path::new(DEFAULT_PID_DIR).join(format!("{name}.pid"))
}
