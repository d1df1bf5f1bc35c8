//! Operator-facing message sink
//!
//! The supervisor reports resource-release problems and fatal startup
//! failures through a [`LogSink`]. A daemon has usually lost its terminal by
//! the time these happen, so the default sink is the system log. Internal
//! diagnostics go through `tracing` as usual; a sink is only for messages an
//! operator should see.

use nix::libc;
use std::ffi::CString;
use std::fmt;

/// Severity of an emitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Info => write!(f, "info"),
            Level::Warning => write!(f, "warning"),
            Level::Error => write!(f, "error"),
        }
    }
}

/// Consumer of operator-facing messages.
pub trait LogSink: Send + Sync {
    fn emit(&self, level: Level, message: &str);
}

/// Sink writing to syslog(3) under the daemon facility.
pub struct Syslog {
    // openlog(3) keeps the pointer, so the string must outlive the sink
    _ident: CString,
}

impl Syslog {
    /// Open the system log with `ident` as the program tag.
    #[must_use]
    pub fn open(ident: &str) -> Self {
        let ident = to_cstring(ident);
        // SAFETY: `ident` is NUL-terminated and stored in the returned value.
        unsafe { libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON) };
        Self { _ident: ident }
    }
}

impl fmt::Debug for Syslog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Syslog").finish_non_exhaustive()
    }
}

impl LogSink for Syslog {
    fn emit(&self, level: Level, message: &str) {
        let priority = match level {
            Level::Info => libc::LOG_INFO,
            Level::Warning => libc::LOG_WARNING,
            Level::Error => libc::LOG_ERR,
        };
        let message = to_cstring(message.trim_end());
        // SAFETY: both the format string and the argument are NUL-terminated;
        // the message is passed through "%s" so it is never interpreted.
        unsafe {
            libc::syslog(priority, c"%s".as_ptr(), message.as_ptr());
        }
    }
}

/// Sink forwarding to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, level: Level, message: &str) {
        let message = message.trim_end();
        match level {
            Level::Info => tracing::info!("{}", message),
            Level::Warning => tracing::warn!("{}", message),
            Level::Error => tracing::error!("{}", message),
        }
    }
}

fn to_cstring(s: &str) -> CString {
    CString::new(s.replace('\0', "\\0")).unwrap_or_default()
}
