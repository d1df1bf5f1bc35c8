//! Units of work and the children that run them
//!
//! A [`WorkerExecutor`] is invoked exactly once in every forked child. When
//! it returns, the child finishes its side of the slot protocol and
//! terminates with the returned status; it never returns into the
//! supervisor's admission loop.

use crate::semaphore::AdmissionSemaphore;
use crate::signals::SignalRouter;
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::kill;
use nix::unistd::{getpgrp, Pid};
use std::collections::HashMap;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};

/// Exit status of a child whose worker panicked
pub const PANIC_EXIT_CODE: i32 = 101;

/// Exit status of a child that could not hand its slot back
pub const RELEASE_FAILED_EXIT_CODE: i32 = 70;

/// Caller-supplied unit of work.
///
/// Returns the exit status for the child process. Do not call
/// `std::process::exit` from inside `execute`: in blocking mode the slot is
/// handed back after `execute` returns.
pub trait WorkerExecutor {
    fn execute(&mut self) -> i32;
}

impl<F> WorkerExecutor for F
where
    F: FnMut() -> i32,
{
    fn execute(&mut self) -> i32 {
        self()
    }
}

/// Whether the supervisor that forked this process has gone away.
///
/// Sends signal 0 to the leader of the caller's process group. A detached
/// supervisor leads its own session, so the leader is the supervisor and
/// stays in place for as long as it runs. Long-running workers poll this to
/// notice teardown, which otherwise leaves them running.
///
/// In the foreground the group leader is whoever started the supervisor
/// (usually the shell job), so the answer is only meaningful when detached.
#[must_use]
pub fn supervisor_terminated() -> bool {
    matches!(kill(getpgrp(), None), Err(Errno::ESRCH))
}

/// A forked child tracked by the admission loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerProcess {
    pub pid: Pid,
    /// The supervisor releases this child's slot when reaping it
    /// (non-blocking mode). When false the child returns the slot itself
    /// and the supervisor only steps in if no confirmation is pending.
    pub admission_held: bool,
}

/// Live children keyed by pid.
#[derive(Debug, Default)]
pub struct WorkerTable {
    workers: HashMap<Pid, WorkerProcess>,
}

impl WorkerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pid: Pid, admission_held: bool) {
        self.workers.insert(
            pid,
            WorkerProcess {
                pid,
                admission_held,
            },
        );
    }

    /// Forget a reaped child; `None` if it was never tracked.
    pub fn remove(&mut self, pid: Pid) -> Option<WorkerProcess> {
        self.workers.remove(&pid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Number of children whose slot the supervisor still owes back
    #[must_use]
    pub fn held(&self) -> usize {
        self.workers.values().filter(|w| w.admission_held).count()
    }
}

/// Body of a freshly forked child. Never returns.
///
/// With `release` set (blocking mode) the child gives its slot back after
/// the worker finishes, including when the worker panics, and only then
/// exits. The release leaves a confirmation so the supervisor can tell it
/// apart from a child that died before getting here.
pub(crate) fn run_child(
    worker: &mut dyn WorkerExecutor,
    router: &SignalRouter,
    release: Option<&AdmissionSemaphore>,
) -> ! {
    if let Err(e) = router.reset_in_child() {
        tracing::warn!("Child {}: {}", std::process::id(), e);
    }

    let mut code = match panic::catch_unwind(AssertUnwindSafe(|| worker.execute())) {
        Ok(code) => code,
        Err(_) => PANIC_EXIT_CODE,
    };

    if let Some(sem) = release {
        if let Err(e) = sem.release_and_confirm() {
            tracing::error!("Child {} could not release its slot: {}", std::process::id(), e);
            code = RELEASE_FAILED_EXIT_CODE;
        }
    }

    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    // SAFETY: _exit skips atexit handlers and destructors that belong to the
    // supervisor image this child was copied from.
    unsafe { libc::_exit(code) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_is_executor() {
        let mut calls = 0;
        let mut worker = || {
            calls += 1;
            7
        };
        assert_eq!(WorkerExecutor::execute(&mut worker), 7);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_table_tracks_held_slots() {
        let mut table = WorkerTable::new();
        assert!(table.is_empty());

        table.insert(Pid::from_raw(100), true);
        table.insert(Pid::from_raw(101), false);
        assert_eq!(table.len(), 2);
        assert_eq!(table.held(), 1);

        let reaped = table.remove(Pid::from_raw(100)).expect("tracked");
        assert!(reaped.admission_held);
        assert!(table.remove(Pid::from_raw(100)).is_none());
        assert_eq!(table.held(), 0);
    }
}
