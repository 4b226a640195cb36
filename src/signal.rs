//! Termination requests.
//!
//! The handler installed by [`Shutdown::install`] does one thing: store `true`
//! into an atomic flag. Releasing resources is left to the main control path,
//! which polls the flag at loop tops and after interrupted waits.
//!
//! The handler is installed without `SA_RESTART`, so a blocked
//! `sem_timedwait` on the receiving thread returns `EINTR` right away. Waiters
//! on other threads see the flag at their next wait slice.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::trace::debug;

/// Signals that request a graceful shutdown.
pub const TERMINATION_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_termination(_signo: nix::libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Read side of a shutdown request, passed explicitly into every session.
#[derive(Debug, Clone, Copy)]
pub struct Shutdown<'a> {
    flag: &'a AtomicBool,
}

impl Shutdown<'static> {
    /// Installs the `SIGINT`/`SIGTERM` handler and returns the flag it sets.
    pub fn install() -> Result<Self, Errno> {
        let action = SigAction::new(
            SigHandler::Handler(on_termination),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in TERMINATION_SIGNALS {
            // SAFETY: the handler only performs an atomic store, which is
            // async-signal-safe.
            unsafe { sigaction(signal, &action) }?;
            debug!(?signal, "termination handler installed");
        }
        Ok(Self { flag: &SIGNALLED })
    }
}

impl<'a> Shutdown<'a> {
    /// Binds a caller-owned flag instead of the signal handler's.
    #[must_use]
    pub const fn from_flag(flag: &'a AtomicBool) -> Self {
        Self { flag }
    }

    #[must_use]
    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Raises the request from code rather than from a signal.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}
