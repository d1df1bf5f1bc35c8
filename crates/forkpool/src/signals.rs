//! Signal routing for the supervisor
//!
//! Handlers only flip a bit in a process-global pending set; the admission
//! loop drains that set once per iteration and acts on each event according
//! to an explicit dispatch table. Nothing runs inside the handler itself, so
//! fork and semaphore bookkeeping are never re-entered.
//!
//! # Process-Global State
//!
//! Unix signal handlers cannot reach instance data, so the handler writes to
//! [`PROCESS_SIGNALS`]. The table deciding what each event means belongs to
//! the [`SignalRouter`] and is passed into the supervisor. Routers built with
//! [`SignalRouter::detached`] use their own pending set and never touch the
//! process dispositions, which lets several supervisors share a test process.

use crate::error::{ForkpoolError, Result};
use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Signals the supervisor cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SignalEvent {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGQUIT (Ctrl+\)
    Quit,
    /// SIGTERM (`kill PID`)
    Terminate,
    /// SIGCHLD
    ChildExited,
}

impl SignalEvent {
    pub const ALL: [SignalEvent; 4] = [
        SignalEvent::Interrupt,
        SignalEvent::Quit,
        SignalEvent::Terminate,
        SignalEvent::ChildExited,
    ];

    #[must_use]
    pub fn signal(self) -> Signal {
        match self {
            SignalEvent::Interrupt => Signal::SIGINT,
            SignalEvent::Quit => Signal::SIGQUIT,
            SignalEvent::Terminate => Signal::SIGTERM,
            SignalEvent::ChildExited => Signal::SIGCHLD,
        }
    }

    #[must_use]
    pub fn from_signal(sig: Signal) -> Option<Self> {
        match sig {
            Signal::SIGINT => Some(SignalEvent::Interrupt),
            Signal::SIGQUIT => Some(SignalEvent::Quit),
            Signal::SIGTERM => Some(SignalEvent::Terminate),
            Signal::SIGCHLD => Some(SignalEvent::ChildExited),
            _ => None,
        }
    }

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// What the supervisor does with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Stop admitting work and release kernel resources.
    Teardown,
    /// Collect exited children and give their slots back.
    Reap,
    /// Install `SIG_IGN`; the event is never delivered.
    Ignore,
}

/// Explicit signal → route mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTable {
    routes: BTreeMap<SignalEvent, Route>,
}

impl DispatchTable {
    /// Table with no routes; signals keep their default disposition.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            routes: BTreeMap::new(),
        }
    }

    /// The supervisor's table, shared by both admission modes.
    ///
    /// Interrupt, quit and terminate tear down. Child exit is routed to
    /// reaping: in blocking mode too, the supervisor has to see every child
    /// go so it can settle slots the child never returned.
    #[must_use]
    pub fn standard() -> Self {
        Self::empty()
            .route(SignalEvent::Interrupt, Route::Teardown)
            .route(SignalEvent::Quit, Route::Teardown)
            .route(SignalEvent::Terminate, Route::Teardown)
            .route(SignalEvent::ChildExited, Route::Reap)
    }

    #[must_use]
    pub fn route(mut self, event: SignalEvent, route: Route) -> Self {
        self.routes.insert(event, route);
        self
    }

    #[must_use]
    pub fn get(&self, event: SignalEvent) -> Option<Route> {
        self.routes.get(&event).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SignalEvent, Route)> + '_ {
        self.routes.iter().map(|(e, r)| (*e, *r))
    }
}

/// Lock-free set of events awaiting dispatch.
#[derive(Debug)]
pub struct PendingSignals(AtomicU32);

impl PendingSignals {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Record an event. Async-signal-safe.
    pub fn mark(&self, event: SignalEvent) {
        self.0.fetch_or(event.bit(), Ordering::SeqCst);
    }

    /// Drain every recorded event, in [`SignalEvent::ALL`] order.
    pub fn take(&self) -> Vec<SignalEvent> {
        let bits = self.0.swap(0, Ordering::AcqRel);
        SignalEvent::ALL
            .into_iter()
            .filter(|e| bits & e.bit() != 0)
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::SeqCst) == 0
    }
}

impl Default for PendingSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending set written by the installed handlers.
pub static PROCESS_SIGNALS: PendingSignals = PendingSignals::new();

extern "C" fn record_signal(sig: libc::c_int) {
    if let Ok(sig) = Signal::try_from(sig) {
        if let Some(event) = SignalEvent::from_signal(sig) {
            PROCESS_SIGNALS.mark(event);
        }
    }
}

/// Installs handlers per a [`DispatchTable`] and hands out pending events.
#[derive(Debug)]
pub struct SignalRouter {
    table: DispatchTable,
    pending: &'static PendingSignals,
    installed: bool,
}

impl SignalRouter {
    /// Router bound to the real process signal dispositions.
    #[must_use]
    pub fn new(table: DispatchTable) -> Self {
        Self {
            table,
            pending: &PROCESS_SIGNALS,
            installed: false,
        }
    }

    /// Router fed only through [`SignalRouter::notify`]; `install` leaves
    /// the process dispositions alone.
    #[must_use]
    pub fn detached(table: DispatchTable, pending: &'static PendingSignals) -> Self {
        Self {
            table,
            pending,
            installed: false,
        }
    }

    #[must_use]
    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    fn is_process_router(&self) -> bool {
        std::ptr::eq(self.pending, &PROCESS_SIGNALS)
    }

    /// Install a disposition for every routed signal.
    ///
    /// Handlers are installed without `SA_RESTART` so a blocking semaphore
    /// wait returns `EINTR` and the loop gets to dispatch.
    ///
    /// # Errors
    /// Returns `SignalInstall` if `sigaction` fails.
    pub fn install(&mut self) -> Result<()> {
        if self.is_process_router() {
            for (event, route) in self.table.iter() {
                let handler = match route {
                    Route::Ignore => SigHandler::SigIgn,
                    Route::Teardown | Route::Reap => SigHandler::Handler(record_signal),
                };
                let flags = if event == SignalEvent::ChildExited {
                    SaFlags::SA_NOCLDSTOP
                } else {
                    SaFlags::empty()
                };
                set_disposition(event.signal(), handler, flags)?;
                debug!("Routed {:?} -> {:?}", event.signal(), route);
            }
        }
        self.installed = true;
        Ok(())
    }

    /// Put every routed signal back to `SIG_DFL`.
    ///
    /// Called in forked children so the worker does not inherit the
    /// supervisor's handlers. Left in place, the SIGCHLD handler would cut
    /// the worker's own blocking calls short with `EINTR`.
    ///
    /// # Errors
    /// Returns `SignalInstall` if `sigaction` fails.
    pub fn reset_in_child(&self) -> Result<()> {
        if self.is_process_router() && self.installed {
            for (event, _) in self.table.iter() {
                set_disposition(event.signal(), SigHandler::SigDfl, SaFlags::empty())?;
            }
            self.pending.take();
        }
        Ok(())
    }

    /// Queue an event as if its signal had arrived.
    pub fn notify(&self, event: SignalEvent) {
        self.pending.mark(event);
    }

    /// Drain pending events that have a delivering route.
    pub fn poll(&self) -> Vec<(SignalEvent, Route)> {
        self.pending
            .take()
            .into_iter()
            .filter_map(|event| match self.table.get(event) {
                Some(Route::Ignore) | None => None,
                Some(route) => Some((event, route)),
            })
            .collect()
    }
}

fn set_disposition(sig: Signal, handler: SigHandler, flags: SaFlags) -> Result<()> {
    let action = SigAction::new(handler, flags, SigSet::empty());
    // SAFETY: record_signal only performs an atomic fetch_or, which is
    // async-signal-safe.
    unsafe { signal::sigaction(sig, &action) }
        .map(drop)
        .map_err(|source| ForkpoolError::SignalInstall {
            signal: sig.as_str(),
            source,
        })
}
