//! Kernel counting semaphore used for admission control
//!
//! Wraps a two-member System V semaphore set. Member 0 counts free slots and
//! starts at the pool capacity; every admitted child holds one unit until it
//! is given back. Member 1 counts releases that children performed
//! themselves and the supervisor has not yet matched to a reaped child.
//!
//! # Auto-release
//!
//! Operations never carry `SEM_UNDO`. The kernel must not adjust the count
//! when a process exits, so the supervisor (non-blocking mode) or the child
//! itself (blocking mode) is the only party that ever gives a unit back. A
//! missing or doubled release therefore shows up as a count mismatch instead
//! of being silently papered over.
//!
//! # Confirmed release
//!
//! [`AdmissionSemaphore::release_and_confirm`] bumps both members in one
//! `semop`, so a child either returned its slot and left a confirmation or
//! did neither. On reaping, the supervisor consumes one confirmation per
//! child and releases on the child's behalf when none is left.

use crate::error::{ForkpoolError, Result};
use nix::errno::Errno;
use nix::libc;
use std::time::Duration;
use tracing::{debug, warn};

/// Permission bits of a freshly created semaphore set (owner only)
const SEMAPHORE_MODE: libc::c_int = 0o600;

/// Members of the set
const SEMAPHORE_COUNT: libc::c_int = 2;

/// Free slots
const SLOTS: libc::c_ushort = 0;

/// Self-releases not yet matched to a reaped child
const CONFIRMED: libc::c_ushort = 1;

/// Outcome of a single acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was taken; the caller now owes one release.
    Granted,
    /// Non-blocking attempt found every slot taken.
    NotAvailable,
    /// A blocking wait was cut short by a signal; nothing was taken.
    Interrupted,
    /// The kernel rejected the operation.
    Error(Errno),
}

/// Handle to the kernel semaphore bounding concurrent children.
#[derive(Debug)]
pub struct AdmissionSemaphore {
    id: libc::c_int,
    key: libc::key_t,
    capacity: u32,
    removed: bool,
}

impl AdmissionSemaphore {
    /// Create (or reopen) the semaphore identified by `key` and set its count
    /// to `capacity` (with no pending confirmations).
    ///
    /// A set that already exists under `key` was left behind by an earlier
    /// owner of the same instance lock that did not shut down cleanly. The
    /// caller holds that lock now, so the stale count is overwritten.
    ///
    /// # Errors
    /// Returns `SemaphoreOpen` if the set cannot be created, opened, or
    /// initialized.
    pub fn open(key: libc::key_t, capacity: u32) -> Result<Self> {
        let open_err = |source| ForkpoolError::SemaphoreOpen { key, source };

        // SAFETY: semget has no memory-safety preconditions.
        let created = unsafe {
            libc::semget(
                key,
                SEMAPHORE_COUNT,
                libc::IPC_CREAT | libc::IPC_EXCL | SEMAPHORE_MODE,
            )
        };
        let id = match Errno::result(created) {
            Ok(id) => {
                debug!("Created semaphore {} for key {:#x}", id, key);
                id
            }
            Err(Errno::EEXIST) => {
                // SAFETY: as above.
                let id =
                    Errno::result(unsafe { libc::semget(key, SEMAPHORE_COUNT, SEMAPHORE_MODE) })
                        .map_err(open_err)?;
                warn!(
                    "Reusing leftover semaphore {} for key {:#x}, resetting count",
                    id, key
                );
                id
            }
            Err(e) => return Err(open_err(e)),
        };

        let value = libc::c_int::try_from(capacity).map_err(|_| {
            ForkpoolError::InvalidConfig(format!("semaphore capacity {capacity} too large"))
        })?;
        for (member, initial) in [(SLOTS, value), (CONFIRMED, 0)] {
            // SAFETY: SETVAL reads its fourth argument as the `val` member of
            // union semun, which an int argument satisfies.
            let member = libc::c_int::from(member);
            Errno::result(unsafe { libc::semctl(id, member, libc::SETVAL, initial) })
                .map_err(open_err)?;
        }

        Ok(Self {
            id,
            key,
            capacity,
            removed: false,
        })
    }

    /// Take one slot.
    ///
    /// With `blocking` the calling process sleeps in the kernel until a slot
    /// frees up or a signal arrives. Without it the call returns
    /// [`Admission::NotAvailable`] immediately when the count is zero.
    pub fn acquire(&self, blocking: bool) -> Admission {
        let flags = if blocking { 0 } else { libc::IPC_NOWAIT };
        admission(self.op(&mut [sembuf(SLOTS, -1, flags)]))
    }

    /// Take one slot, sleeping in the kernel for at most `timeout`.
    ///
    /// An expired wait reports [`Admission::NotAvailable`]. Where the timed
    /// wait is unavailable this behaves like `acquire(true)`.
    pub fn acquire_for(&self, timeout: Duration) -> Admission {
        admission(self.timed_op(&mut [sembuf(SLOTS, -1, 0)], timeout))
    }

    /// Give one slot back.
    ///
    /// # Errors
    /// Returns `SemaphoreOverflow` if the count is already at capacity (a
    /// release without a matching acquire), or `SemaphoreRelease` if the
    /// kernel rejects the operation.
    pub fn release(&self) -> Result<()> {
        self.ensure_below_capacity()?;
        self.op_retrying(&mut [sembuf(SLOTS, 1, 0)])
            .map_err(ForkpoolError::SemaphoreRelease)
    }

    /// Give one slot back and leave a confirmation for the supervisor, as a
    /// single atomic operation.
    ///
    /// # Errors
    /// Same as [`AdmissionSemaphore::release`].
    pub fn release_and_confirm(&self) -> Result<()> {
        self.ensure_below_capacity()?;
        self.op_retrying(&mut [sembuf(SLOTS, 1, 0), sembuf(CONFIRMED, 1, 0)])
            .map_err(ForkpoolError::SemaphoreRelease)
    }

    /// Consume one pending confirmation. `false` when none is left.
    ///
    /// # Errors
    /// Returns `SemaphoreRelease` if the kernel rejects the operation.
    pub fn take_confirmation(&self) -> Result<bool> {
        loop {
            match self.op(&mut [sembuf(CONFIRMED, -1, libc::IPC_NOWAIT)]) {
                Ok(()) => return Ok(true),
                Err(Errno::EAGAIN) => return Ok(false),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ForkpoolError::SemaphoreRelease(e)),
            }
        }
    }

    /// Current number of free slots.
    ///
    /// # Errors
    /// Returns `SemaphoreRelease` if the kernel cannot report the value.
    pub fn count(&self) -> Result<u32> {
        self.value(SLOTS)
    }

    /// Self-releases not yet matched to a reaped child.
    ///
    /// # Errors
    /// Returns `SemaphoreRelease` if the kernel cannot report the value.
    pub fn confirmations(&self) -> Result<u32> {
        self.value(CONFIRMED)
    }

    fn ensure_below_capacity(&self) -> Result<()> {
        if self.count()? >= self.capacity {
            return Err(ForkpoolError::SemaphoreOverflow {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn value(&self, member: libc::c_ushort) -> Result<u32> {
        // SAFETY: GETVAL takes no fourth argument.
        let value = Errno::result(unsafe {
            libc::semctl(self.id, libc::c_int::from(member), libc::GETVAL)
        })
        .map_err(ForkpoolError::SemaphoreRelease)?;
        Ok(value.unsigned_abs())
    }

    /// Remove the set from the kernel.
    ///
    /// Safe to call more than once; only the first call talks to the kernel.
    ///
    /// # Errors
    /// Returns `SemaphoreRemove` if removal fails. A set that is already gone
    /// (`EINVAL`/`EIDRM`) still reports an error so the caller can log it,
    /// but the handle is marked removed either way.
    pub fn destroy(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        // SAFETY: IPC_RMID takes no fourth argument.
        Errno::result(unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) })
            .map(drop)
            .map_err(ForkpoolError::SemaphoreRemove)
    }

    #[must_use]
    pub fn key(&self) -> libc::key_t {
        self.key
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    fn op(&self, ops: &mut [libc::sembuf]) -> std::result::Result<(), Errno> {
        // SAFETY: `ops` is a valid sembuf array and nsops matches its length.
        Errno::result(unsafe { libc::semop(self.id, ops.as_mut_ptr(), ops.len()) }).map(drop)
    }

    fn op_retrying(&self, ops: &mut [libc::sembuf]) -> std::result::Result<(), Errno> {
        loop {
            match self.op(ops) {
                Err(Errno::EINTR) => continue,
                other => return other,
            }
        }
    }

    #[cfg(all(
        target_os = "linux",
        any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "riscv64",
            target_arch = "loongarch64"
        )
    ))]
    fn timed_op(
        &self,
        ops: &mut [libc::sembuf],
        timeout: Duration,
    ) -> std::result::Result<(), Errno> {
        use nix::sys::time::TimeSpec;

        let timeout = TimeSpec::from(timeout);
        let timeout: &libc::timespec = timeout.as_ref();
        // SAFETY: `ops` is a valid sembuf array, nsops matches its length,
        // and `timeout` points to a live timespec for the whole call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_semtimedop,
                self.id,
                ops.as_mut_ptr(),
                ops.len(),
                timeout as *const libc::timespec,
            )
        };
        Errno::result(rc).map(drop)
    }

    #[cfg(not(all(
        target_os = "linux",
        any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "riscv64",
            target_arch = "loongarch64"
        )
    )))]
    fn timed_op(
        &self,
        ops: &mut [libc::sembuf],
        _timeout: Duration,
    ) -> std::result::Result<(), Errno> {
        self.op(ops)
    }
}

fn admission(result: std::result::Result<(), Errno>) -> Admission {
    match result {
        Ok(()) => Admission::Granted,
        Err(Errno::EAGAIN) => Admission::NotAvailable,
        Err(Errno::EINTR) => Admission::Interrupted,
        Err(e) => Admission::Error(e),
    }
}

fn sembuf(member: libc::c_ushort, delta: libc::c_short, flags: libc::c_int) -> libc::sembuf {
    libc::sembuf {
        sem_num: member,
        sem_op: delta,
        // IPC_NOWAIT fits in a short on every supported platform
        sem_flg: flags as libc::c_short,
    }
}
