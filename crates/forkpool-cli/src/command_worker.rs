//! Worker that runs an external command in each child
//!
//! The program is resolved against `PATH` once, in the supervisor, so every
//! child starts from the same absolute path even after the daemon has
//! changed session and the caller's shell is gone.

use forkpool::{ForkpoolError, Result, WorkerExecutor};
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use tracing::{debug, error};

/// Exit status reported when the command cannot be started (shell convention)
pub const SPAWN_FAILED_EXIT_CODE: i32 = 127;

/// Resolve a program name to its absolute path.
///
/// # Errors
/// Returns an error if the program cannot be found in PATH or as a valid path.
pub fn resolve_program(program: &str) -> Result<PathBuf> {
    which::which(program).map_err(|e| {
        ForkpoolError::CommandExecution(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{}: {}", program, e),
        ))
    })
}

/// Runs `program args...` and exits with its status.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandWorker {
    /// Build a worker from `command[0]` (looked up in PATH) and its arguments.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for an empty command, or `CommandExecution`
    /// if the program cannot be found.
    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ForkpoolError::InvalidConfig("no command specified".to_string()))?;
        Ok(Self {
            program: resolve_program(program)?,
            args: args.iter().map(OsString::from).collect(),
        })
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    #[must_use]
    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

impl WorkerExecutor for CommandWorker {
    fn execute(&mut self) -> i32 {
        match Command::new(&self.program).args(&self.args).status() {
            Ok(status) => {
                debug!("{} exited: {}", self.program.display(), status);
                exit_code(status)
            }
            Err(e) => {
                error!("Failed to run {}: {}", self.program.display(), e);
                SPAWN_FAILED_EXIT_CODE
            }
        }
    }
}

/// Shell-style exit code: the status itself, or 128 + signal number.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}
