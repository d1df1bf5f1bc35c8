//! Singleton enforcement through a pid file
//!
//! The pid file is both the lock and the liveness oracle: a live process
//! recorded in it owns the identity, a dead one leaves a stale file that the
//! next starter may reclaim. The file path also seeds the semaphore key, so
//! one path always maps to one kernel semaphore.

use crate::error::{ForkpoolError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::libc;
use nix::sys::signal::{kill, killpg};
use nix::unistd::Pid;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pid files are world-readable so status tooling can inspect them
const PID_FILE_MODE: u32 = 0o644;

/// Upper bound on create/reclaim rounds before giving up
pub const MAX_LOCK_ATTEMPTS: u32 = 8;

/// How long an empty pid file may stay empty before it counts as garbage.
/// A starter that has created the file but not yet locked it leaves it
/// empty for a moment.
const EMPTY_FILE_GRACE: Duration = Duration::from_millis(500);

const EMPTY_FILE_POLL: Duration = Duration::from_millis(10);

/// Result of trying to claim an instance identity.
#[derive(Debug)]
pub enum Acquisition {
    /// The caller now owns the pid file.
    Acquired(InstanceLock),
    /// Another live process (or the caller itself) already owns it.
    AlreadyRunning { pid: Pid },
}

/// Exclusive claim on a pid file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLock {
    path: PathBuf,
    owner_pid: Pid,
}

/// What [`InstanceLock::release`] found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRelease {
    /// The file recorded our pid and was deleted.
    Removed,
    /// The file records a different process; left untouched.
    NotOwner(Option<Pid>),
    /// Nothing at the path any more.
    Missing,
}

impl InstanceLock {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn owner_pid(&self) -> Pid {
        self.owner_pid
    }

    /// Delete the pid file if it still records the owner pid.
    ///
    /// # Errors
    /// Returns `PidFileRead` or `PidFileRemove` if the file exists but
    /// cannot be read or deleted.
    pub fn release(&self) -> Result<LockRelease> {
        let recorded = match read_pid(&self.path) {
            Ok(pid) => pid,
            Err(ForkpoolError::PidFileRead { source, .. })
                if source.kind() == io::ErrorKind::NotFound =>
            {
                return Ok(LockRelease::Missing);
            }
            Err(e) => return Err(e),
        };

        if recorded != Some(self.owner_pid) {
            debug!(
                "Pid file {} now records {:?}, leaving it in place",
                self.path.display(),
                recorded
            );
            return Ok(LockRelease::NotOwner(recorded));
        }

        match fs::remove_file(&self.path) {
            Ok(()) => Ok(LockRelease::Removed),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LockRelease::Missing),
            Err(source) => Err(ForkpoolError::PidFileRemove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Acquires the pid file lock for one identity.
#[derive(Debug, Clone)]
pub struct InstanceGuard {
    path: PathBuf,
    max_attempts: u32,
}

impl InstanceGuard {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_attempts: MAX_LOCK_ATTEMPTS,
        }
    }

    /// Override how many create/reclaim rounds `acquire` may take.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Claim the identity for `pid`.
    ///
    /// Each round either creates the pid file, reports the live owner, or
    /// deletes a stale file and goes around again.
    ///
    /// # Errors
    /// - `PidFileCreate` if a fresh file cannot be written
    /// - `PidFileRead` if an existing file cannot be read
    /// - `PidFileRemove` if a stale file cannot be deleted
    /// - `LockContention` if every round was spent reclaiming or racing
    pub fn acquire(&self, pid: Pid) -> Result<Acquisition> {
        for attempt in 1..=self.max_attempts {
            match write_pid(&self.path, pid) {
                Ok(()) => {
                    info!("Acquired pid file {} for {}", self.path.display(), pid);
                    return Ok(Acquisition::Acquired(InstanceLock {
                        path: self.path.clone(),
                        owner_pid: pid,
                    }));
                }
                Err(ForkpoolError::PidFileCreate { source, .. })
                    if source.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }

            let recorded = match read_settled(&self.path) {
                Ok(recorded) => recorded,
                // Removed between our create attempt and the read
                Err(ForkpoolError::PidFileRead { source, .. })
                    if source.kind() == io::ErrorKind::NotFound =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            };

            match recorded {
                Some(owner) if owner == pid || is_alive(owner) => {
                    debug!("Instance {} already running as {}", self.path.display(), owner);
                    return Ok(Acquisition::AlreadyRunning { pid: owner });
                }
                Some(owner) => {
                    info!(
                        "Reclaiming stale pid file {} (pid {} is gone, attempt {})",
                        self.path.display(),
                        owner,
                        attempt
                    );
                }
                None => {
                    warn!(
                        "Pid file {} does not hold a valid pid, reclaiming",
                        self.path.display()
                    );
                }
            }

            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(ForkpoolError::PidFileRemove {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }

        Err(ForkpoolError::LockContention {
            path: self.path.clone(),
            attempts: self.max_attempts,
        })
    }
}

/// Create `path` exclusively and record `pid` in it.
///
/// The file is flock'ed while being written so a concurrent reader never
/// sees a partial pid, then chmod'ed to 0644.
///
/// # Errors
/// Returns `PidFileCreate`; an existing file surfaces as `AlreadyExists`.
pub fn write_pid(path: &Path, pid: Pid) -> Result<()> {
    let create_err = |source| ForkpoolError::PidFileCreate {
        path: path.to_path_buf(),
        source,
    };

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(create_err)?;

    let mut locked = Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| create_err(io::Error::from(errno)))?;
    locked
        .write_all(pid.as_raw().to_string().as_bytes())
        .and_then(|()| locked.sync_all())
        .map_err(create_err)?;
    drop(locked);

    fs::set_permissions(path, fs::Permissions::from_mode(PID_FILE_MODE)).map_err(create_err)?;
    Ok(())
}

/// Read the pid recorded in `path`.
///
/// Takes a shared flock first, so a writer still filling the file is waited
/// out. Returns `Ok(None)` when the content is not a positive decimal
/// integer.
///
/// # Errors
/// Returns `PidFileRead` if the file cannot be opened, locked or read.
pub fn read_pid(path: &Path) -> Result<Option<Pid>> {
    Ok(parse_pid(&read_locked(path)?))
}

/// [`read_pid`] that keeps re-reading an empty file for up to
/// [`EMPTY_FILE_GRACE`].
fn read_settled(path: &Path) -> Result<Option<Pid>> {
    let deadline = Instant::now() + EMPTY_FILE_GRACE;
    loop {
        let content = read_locked(path)?;
        if !content.trim().is_empty() || Instant::now() >= deadline {
            return Ok(parse_pid(&content));
        }
        std::thread::sleep(EMPTY_FILE_POLL);
    }
}

fn read_locked(path: &Path) -> Result<String> {
    let read_err = |source| ForkpoolError::PidFileRead {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(read_err)?;
    let mut locked = loop {
        match Flock::lock(file, FlockArg::LockShared) {
            Ok(locked) => break locked,
            Err((unlocked, Errno::EINTR)) => file = unlocked,
            Err((_, errno)) => return Err(read_err(io::Error::from(errno))),
        }
    };

    let mut content = String::new();
    locked.read_to_string(&mut content).map_err(read_err)?;
    Ok(content)
}

fn parse_pid(content: &str) -> Option<Pid> {
    content
        .trim()
        .parse::<libc::pid_t>()
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}

/// Signal-zero check of `pid` and of the process group it leads.
///
/// `EPERM` still proves existence: the process is there, we just may not
/// signal it.
#[must_use]
pub fn is_alive(pid: Pid) -> bool {
    let answers = |res: nix::Result<()>| matches!(res, Ok(()) | Err(Errno::EPERM));
    answers(kill(pid, None)) || answers(killpg(pid, None))
}

/// Derive the System V key for the semaphore paired with `path`.
///
/// The canonical path is hashed, so relative and absolute spellings of one
/// file agree and the key survives the file being recreated (unlike
/// `ftok(3)`, which follows the inode). The result is positive and never
/// `IPC_PRIVATE`.
///
/// # Errors
/// Returns `Io` if the path cannot be canonicalized (it must exist).
pub fn semaphore_key(path: &Path) -> Result<libc::key_t> {
    let canonical = fs::canonicalize(path)?;
    let digest = Sha256::digest(canonical.as_os_str().as_encoded_bytes());
    let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7fff_ffff;
    let key = libc::key_t::try_from(raw).unwrap_or(1);
    Ok(if key == libc::IPC_PRIVATE { 1 } else { key })
}

/// Point-in-time view of a pid file, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum InstanceStatus {
    /// No pid file at the path.
    NotRunning,
    /// The recorded process is alive.
    Running { pid: i32 },
    /// The recorded process is gone; the next start will reclaim the file.
    Stale { pid: i32 },
    /// The file exists but does not hold a pid.
    Invalid,
}

impl InstanceStatus {
    /// Inspect `path` without modifying anything.
    ///
    /// # Errors
    /// Returns `PidFileRead` if the file exists but cannot be read.
    pub fn inspect(path: &Path) -> Result<Self> {
        match read_pid(path) {
            Ok(Some(pid)) if is_alive(pid) => Ok(InstanceStatus::Running { pid: pid.as_raw() }),
            Ok(Some(pid)) => Ok(InstanceStatus::Stale { pid: pid.as_raw() }),
            Ok(None) => Ok(InstanceStatus::Invalid),
            Err(ForkpoolError::PidFileRead { source, .. })
                if source.kind() == io::ErrorKind::NotFound =>
            {
                Ok(InstanceStatus::NotRunning)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nix::unistd::{getpid, getppid};
    use tempfile::TempDir;

    fn pid_path() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("test.pid");
        (dir, path)
    }

    /// A pid that belonged to a process which has since been reaped.
    fn dead_pid() -> Pid {
        let mut child = std::process::Command::new("true").spawn().expect("spawn true");
        let raw = child.id() as libc::pid_t;
        child.wait().expect("wait true");
        Pid::from_raw(raw)
    }

    #[test]
    fn test_pid_roundtrip() {
        let (_dir, path) = pid_path();
        write_pid(&path, Pid::from_raw(4242)).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(Pid::from_raw(4242)));
        assert_eq!(fs::read_to_string(&path).unwrap(), "4242");
    }

    #[test]
    fn test_pid_file_mode() {
        let (_dir, path) = pid_path();
        write_pid(&path, getpid()).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_write_refuses_existing_file() {
        let (_dir, path) = pid_path();
        fs::write(&path, "1").unwrap();
        match write_pid(&path, getpid()) {
            Err(ForkpoolError::PidFileCreate { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists);
            }
            other => panic!("expected PidFileCreate, got {other:?}"),
        }
    }

    #[test]
    fn test_read_rejects_garbage() {
        let (_dir, path) = pid_path();
        fs::write(&path, "not-a-pid\n").unwrap();
        assert_eq!(read_pid(&path).unwrap(), None);
        fs::write(&path, "0").unwrap();
        assert_eq!(read_pid(&path).unwrap(), None);
        fs::write(&path, "-5").unwrap();
        assert_eq!(read_pid(&path).unwrap(), None);
    }

    #[test]
    fn test_acquire_fresh() {
        let (_dir, path) = pid_path();
        let acquisition = InstanceGuard::new(&path).acquire(getpid()).unwrap();
        match acquisition {
            Acquisition::Acquired(lock) => {
                assert_eq!(lock.owner_pid(), getpid());
                assert_eq!(lock.path(), path.as_path());
            }
            other => panic!("expected Acquired, got {other:?}"),
        }
        assert_eq!(read_pid(&path).unwrap(), Some(getpid()));
    }

    #[test]
    fn test_acquire_own_pid_is_already_running() {
        let (_dir, path) = pid_path();
        write_pid(&path, getpid()).unwrap();
        let acquisition = InstanceGuard::new(&path).acquire(getpid()).unwrap();
        assert!(matches!(acquisition, Acquisition::AlreadyRunning { pid } if pid == getpid()));
    }

    #[test]
    fn test_acquire_live_owner_leaves_file_alone() {
        let (_dir, path) = pid_path();
        let owner = getppid();
        write_pid(&path, owner).unwrap();

        let acquisition = InstanceGuard::new(&path).acquire(getpid()).unwrap();
        assert!(matches!(acquisition, Acquisition::AlreadyRunning { pid } if pid == owner));
        assert_eq!(read_pid(&path).unwrap(), Some(owner));
    }

    #[test]
    fn test_acquire_reclaims_stale_file() {
        let (_dir, path) = pid_path();
        let stale = dead_pid();
        assert!(!is_alive(stale));
        write_pid(&path, stale).unwrap();

        let acquisition = InstanceGuard::new(&path).acquire(getpid()).unwrap();
        assert!(matches!(acquisition, Acquisition::Acquired(_)));
        assert_eq!(read_pid(&path).unwrap(), Some(getpid()));
    }

    #[test]
    fn test_acquire_reclaims_garbage_file() {
        let (_dir, path) = pid_path();
        fs::write(&path, "garbage").unwrap();
        let acquisition = InstanceGuard::new(&path).acquire(getpid()).unwrap();
        assert!(matches!(acquisition, Acquisition::Acquired(_)));
    }

    #[test]
    fn test_acquire_waits_for_writer_holding_lock() {
        let (_dir, path) = pid_path();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        let mut writer = Flock::lock(file, FlockArg::LockExclusive).unwrap();

        let contender = {
            let path = path.clone();
            std::thread::spawn(move || InstanceGuard::new(&path).acquire(getpid()))
        };
        std::thread::sleep(Duration::from_millis(100));
        let owner = getppid();
        writer.write_all(owner.to_string().as_bytes()).unwrap();
        drop(writer);

        let acquisition = contender.join().unwrap().unwrap();
        assert!(matches!(acquisition, Acquisition::AlreadyRunning { pid } if pid == owner));
        assert_eq!(read_pid(&path).unwrap(), Some(owner));
    }

    #[test]
    fn test_acquire_waits_for_empty_file_to_fill() {
        let (_dir, path) = pid_path();
        fs::write(&path, "").unwrap();
        let owner = getppid();

        let filler = {
            let path = path.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                fs::write(&path, owner.to_string()).unwrap();
            })
        };

        let acquisition = InstanceGuard::new(&path).acquire(getpid()).unwrap();
        filler.join().unwrap();
        assert!(matches!(acquisition, Acquisition::AlreadyRunning { pid } if pid == owner));
        assert_eq!(read_pid(&path).unwrap(), Some(owner));
    }

    #[test]
    fn test_acquire_reclaims_abandoned_empty_file() {
        let (_dir, path) = pid_path();
        fs::write(&path, "").unwrap();

        let started = Instant::now();
        let acquisition = InstanceGuard::new(&path).acquire(getpid()).unwrap();
        assert!(matches!(acquisition, Acquisition::Acquired(_)));
        assert!(started.elapsed() >= EMPTY_FILE_GRACE);
        assert_eq!(read_pid(&path).unwrap(), Some(getpid()));
    }

    #[test]
    fn test_acquire_is_bounded() {
        let (_dir, path) = pid_path();
        write_pid(&path, dead_pid()).unwrap();
        let err = InstanceGuard::new(&path).with_max_attempts(1).acquire(getpid());
        assert!(matches!(
            err,
            Err(ForkpoolError::LockContention { attempts: 1, .. })
        ));
    }

    #[test]
    fn test_acquire_in_missing_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("x.pid");
        let err = InstanceGuard::new(&path).acquire(getpid());
        assert!(matches!(err, Err(ForkpoolError::PidFileCreate { .. })));
    }

    #[test]
    fn test_release_only_by_owner() {
        let (_dir, path) = pid_path();
        let lock = match InstanceGuard::new(&path).acquire(getpid()).unwrap() {
            Acquisition::Acquired(lock) => lock,
            other => panic!("expected Acquired, got {other:?}"),
        };

        // Replaced by someone else in the meantime
        fs::remove_file(&path).unwrap();
        write_pid(&path, Pid::from_raw(1)).unwrap();
        assert_eq!(
            lock.release().unwrap(),
            LockRelease::NotOwner(Some(Pid::from_raw(1)))
        );
        assert!(path.exists());
    }

    #[test]
    fn test_release_twice() {
        let (_dir, path) = pid_path();
        let lock = match InstanceGuard::new(&path).acquire(getpid()).unwrap() {
            Acquisition::Acquired(lock) => lock,
            other => panic!("expected Acquired, got {other:?}"),
        };
        assert_eq!(lock.release().unwrap(), LockRelease::Removed);
        assert!(!path.exists());
        assert_eq!(lock.release().unwrap(), LockRelease::Missing);
    }

    #[test]
    fn test_semaphore_key_is_stable() {
        let (dir, path) = pid_path();
        fs::write(&path, "1").unwrap();
        let first = semaphore_key(&path).unwrap();

        // Recreating the file (new inode) keeps the key
        fs::remove_file(&path).unwrap();
        fs::write(&path, "2").unwrap();
        assert_eq!(semaphore_key(&path).unwrap(), first);

        let other = dir.path().join("other.pid");
        fs::write(&other, "1").unwrap();
        assert_ne!(semaphore_key(&other).unwrap(), first);
        assert!(first > 0);
    }

    #[test]
    fn test_semaphore_key_ignores_spelling() {
        let (dir, path) = pid_path();
        fs::write(&path, "1").unwrap();
        let dotted = dir.path().join(".").join("test.pid");
        assert_eq!(
            semaphore_key(&path).unwrap(),
            semaphore_key(&dotted).unwrap()
        );
    }

    #[test]
    fn test_status_inspect() {
        let (_dir, path) = pid_path();
        assert_eq!(InstanceStatus::inspect(&path).unwrap(), InstanceStatus::NotRunning);

        write_pid(&path, getpid()).unwrap();
        assert_eq!(
            InstanceStatus::inspect(&path).unwrap(),
            InstanceStatus::Running {
                pid: getpid().as_raw()
            }
        );

        fs::remove_file(&path).unwrap();
        let stale = dead_pid();
        write_pid(&path, stale).unwrap();
        assert_eq!(
            InstanceStatus::inspect(&path).unwrap(),
            InstanceStatus::Stale {
                pid: stale.as_raw()
            }
        );

        fs::remove_file(&path).unwrap();
        fs::write(&path, "junk").unwrap();
        assert_eq!(InstanceStatus::inspect(&path).unwrap(), InstanceStatus::Invalid);
    }
}
