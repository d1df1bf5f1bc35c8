//! Error types for the forkpool library

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while supervising a worker pool
#[derive(Error, Debug)]
pub enum ForkpoolError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Process control errors
    #[error("Could not daemonize: {0}")]
    Daemonize(String),

    #[error("Could not fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("Failed to install handler for {signal}: {source}")]
    SignalInstall {
        signal: &'static str,
        source: nix::Error,
    },

    // Instance lock errors
    #[error("Create pid file [{path}] failure: {source}")]
    PidFileCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Read pid file [{path}] failure: {source}")]
    PidFileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Delete pid file [{path}] failure: {source}")]
    PidFileRemove {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Gave up acquiring pid file [{path}] after {attempts} attempts")]
    LockContention { path: PathBuf, attempts: u32 },

    // Semaphore errors
    #[error("Could not get semaphore id for key {key:#x}: {source}")]
    SemaphoreOpen { key: i32, source: nix::Error },

    #[error("Acquire a semaphore failure: {0}")]
    SemaphoreAcquire(#[source] nix::Error),

    #[error("Release a semaphore failure: {0}")]
    SemaphoreRelease(#[source] nix::Error),

    #[error("Semaphore already at capacity {capacity}, refusing to release")]
    SemaphoreOverflow { capacity: u32 },

    #[error("Remove semaphore failure: {0}")]
    SemaphoreRemove(#[source] nix::Error),

    // Worker errors
    #[error("Command execution failed: {0}")]
    CommandExecution(#[source] std::io::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for forkpool operations
pub type Result<T> = std::result::Result<T, ForkpoolError>;
