//! Admission loops
//!
//! Both loops dispatch pending signals at the top of every iteration, then
//! try to take a semaphore slot and fork a child for it.
//!
//! Slot accounting per mode:
//! - Blocking: the child gives its own slot back after the worker returns
//!   (also on panic) and leaves a confirmation. The supervisor still reaps
//!   every child; one that exits without a matching confirmation (killed
//!   by a signal, say) has its slot released by the supervisor instead.
//! - Non-blocking: the slot stays charged until the supervisor reaps the
//!   child, and each reaped child it tracked releases exactly one slot.
//!
//! Either way every tracked child is settled exactly once, so the count
//! cannot drift. Confirmations carry no pid, so the warning for a missing
//! one may name a sibling of the child that actually died; the count comes
//! out the same.

use super::{Supervisor, SupervisorState};
use crate::error::{ForkpoolError, Result};
use crate::log::Level;
use crate::semaphore::{Admission, AdmissionSemaphore};
use crate::signals::{Route, SignalEvent};
use crate::worker::{run_child, WorkerExecutor};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Pause between attempts while every slot is held (non-blocking mode)
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Longest single kernel wait for a slot (blocking mode). Bounds how late a
/// signal that lands just before the wait, or an unconfirmed child, is
/// noticed.
pub const BLOCKING_WAIT: Duration = Duration::from_millis(100);

impl<W: WorkerExecutor> Supervisor<W> {
    /// Run the admission loop for the configured mode until a teardown
    /// signal arrives; returns that signal.
    ///
    /// # Errors
    /// `SemaphoreAcquire` on a kernel error, `Fork` if a child cannot be
    /// started, or any release failure while reaping.
    pub fn admission_loop(&mut self) -> Result<SignalEvent> {
        if self.semaphore.is_none() {
            return Err(ForkpoolError::InvalidConfig(
                "admission loop started before startup()".to_string(),
            ));
        }
        if self.config.mode().is_blocking() {
            self.state = SupervisorState::BlockingLoop;
            self.blocking_loop()
        } else {
            self.state = SupervisorState::NonBlockingLoop;
            self.non_blocking_loop()
        }
    }

    fn blocking_loop(&mut self) -> Result<SignalEvent> {
        loop {
            if let Some(signal) = self.dispatch_signals()? {
                return Ok(signal);
            }

            match self.sem()?.acquire_for(BLOCKING_WAIT) {
                Admission::Granted => self.spawn_worker(true)?,
                // Wait expired: settle children that died without releasing
                Admission::NotAvailable => {
                    self.reap_children()?;
                }
                // A signal cut the wait short, dispatch it on the next pass
                Admission::Interrupted => continue,
                Admission::Error(e) => return Err(ForkpoolError::SemaphoreAcquire(e)),
            }
        }
    }

    fn non_blocking_loop(&mut self) -> Result<SignalEvent> {
        loop {
            if let Some(signal) = self.dispatch_signals()? {
                return Ok(signal);
            }

            match self.sem()?.acquire(false) {
                Admission::Granted => self.spawn_worker(false)?,
                Admission::NotAvailable => {
                    if self.reap_children()? == 0 {
                        std::thread::sleep(POLL_INTERVAL);
                    }
                }
                Admission::Interrupted => continue,
                Admission::Error(e) => return Err(ForkpoolError::SemaphoreAcquire(e)),
            }
        }
    }

    /// Act on pending signals. Returns the first teardown signal, if any.
    fn dispatch_signals(&mut self) -> Result<Option<SignalEvent>> {
        let mut teardown = None;
        for (event, route) in self.router.poll() {
            match route {
                Route::Teardown => {
                    teardown.get_or_insert(event);
                }
                Route::Reap => {
                    self.reap_children()?;
                }
                Route::Ignore => {}
            }
        }
        Ok(teardown)
    }

    /// Fork one child for a slot that has just been granted.
    ///
    /// On fork failure the slot is handed back before the error returns.
    fn spawn_worker(&mut self, child_releases: bool) -> Result<()> {
        // SAFETY: the supervisor runs single-threaded (see module docs).
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                self.children.insert(child, !child_releases);
                debug!("Started worker {}", child);
                Ok(())
            }
            Ok(ForkResult::Child) => {
                let release = if child_releases {
                    self.semaphore.as_ref()
                } else {
                    None
                };
                run_child(&mut self.worker, &self.router, release)
            }
            Err(e) => {
                if let Err(release_err) = self.sem()?.release() {
                    warn!("Could not return slot after failed fork: {}", release_err);
                }
                Err(ForkpoolError::Fork(e))
            }
        }
    }

    /// Reap every child that has exited so far without waiting.
    ///
    /// Each tracked child settles its slot exactly once: the supervisor
    /// releases it if it held it, or if the child owed its own release and
    /// no confirmation is pending. Untracked children change nothing.
    /// Returns how many slots the supervisor released.
    ///
    /// # Errors
    /// `Io` if `waitpid` fails, or any semaphore failure while releasing.
    pub fn reap_children(&mut self) -> Result<usize> {
        let mut released = 0;
        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ForkpoolError::Io(std::io::Error::from(e))),
                Ok(status) => status,
            };
            let Some(pid) = status.pid() else { continue };

            match self.children.remove(pid) {
                Some(worker) if worker.admission_held => {
                    self.sem()?.release()?;
                    released += 1;
                    trace!("Reaped worker {}: {:?}", pid, status);
                }
                Some(_) if self.sem()?.take_confirmation()? => {
                    trace!("Reaped worker {} (slot already returned)", pid);
                }
                Some(_) => {
                    self.sem()?.release()?;
                    released += 1;
                    let message = format!(
                        "Worker {} exited without returning its slot ({:?}), released it",
                        pid, status
                    );
                    self.emit(Level::Warning, &message);
                }
                None => debug!("Reaped untracked child {}: {:?}", pid, status),
            }
        }
        Ok(released)
    }

    fn sem(&self) -> Result<&AdmissionSemaphore> {
        self.semaphore.as_ref().ok_or_else(|| {
            ForkpoolError::InvalidConfig("semaphore released while admitting".to_string())
        })
    }
}
