//! Gate waits that give up when a shutdown has been requested.

use std::time::Duration;

use rustix::io::Errno;

use crate::ipc::Ownership;
use crate::ipc::sem::{NamedSemaphore, SemError};
use crate::signal::Shutdown;
use crate::trace::{debug, trace};

/// Why a wait did not take a permit.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// Shutdown was requested before or during the wait.
    #[error("wait on `{0}` interrupted by shutdown request")]
    Interrupted(String),
    #[error(transparent)]
    Gate(#[from] SemError),
}

/// Longest single block in `sem_timedwait` before the shutdown flag is
/// looked at again.
pub const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Takes one permit from `gate`, blocking as long as needed.
///
/// The wait blocks in slices of [`WAIT_SLICE`] and ends with
/// [`WaitError::Interrupted`] at the first slice boundary after `shutdown`
/// was requested. A signal that interrupts a slice (`EINTR`) is retried the
/// same way. A request raised before the call returns without blocking.
pub fn wait_gate<Mode: Ownership>(
    gate: &NamedSemaphore<Mode>,
    shutdown: &Shutdown<'_>,
) -> Result<(), WaitError> {
    loop {
        if shutdown.requested() {
            debug!(gate = %gate.name(), "shutdown requested, not waiting");
            return Err(WaitError::Interrupted(gate.name().to_string()));
        }
        match gate.wait_timeout(WAIT_SLICE) {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) if err.errno() == Some(Errno::INTR) => {
                trace!(gate = %gate.name(), "wait interrupted by signal");
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Creator, IpcName, Opener};
    use nix::sys::pthread::{Pthread, pthread_kill, pthread_self};
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
    use serial_test::serial;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    fn unique_name(suffix: &str) -> IpcName {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        IpcName::new(format!(
            "/tandem-wait-{}-{}-{}",
            std::process::id(),
            suffix,
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
        .unwrap()
    }

    fn gate_or_skip(suffix: &str) -> Option<NamedSemaphore<Creator>> {
        match NamedSemaphore::<Creator>::create(&unique_name(suffix), 0) {
            Ok(sem) => Some(sem),
            Err(err) if matches!(err.errno(), Some(Errno::ACCESS | Errno::NOSYS)) => {
                eprintln!("Skipping: {err}");
                None
            }
            Err(err) => panic!("create gate: {err}"),
        }
    }

    extern "C" fn benign(_: nix::libc::c_int) {}

    /// SIGUSR1 with a do-nothing handler and no SA_RESTART: interrupts
    /// `sem_timedwait` without requesting shutdown.
    fn install_benign_handler() {
        let action = SigAction::new(SigHandler::Handler(benign), SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(Signal::SIGUSR1, &action) }.expect("sigaction");
    }

    /// Spawns a thread blocked in `wait_gate` and hands back its pthread id.
    fn spawn_waiter(
        gate: NamedSemaphore<Opener>,
        flag: &'static AtomicBool,
    ) -> (Pthread, thread::JoinHandle<Result<(), WaitError>>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            tx.send(pthread_self()).expect("send tid");
            wait_gate(&gate, &Shutdown::from_flag(flag))
        });
        let tid = rx.recv().expect("recv tid");
        // give the waiter time to block
        thread::sleep(Duration::from_millis(50));
        (tid, handle)
    }

    #[test]
    fn returns_when_permit_available() {
        let Some(gate) = gate_or_skip("ready") else { return };
        let flag = AtomicBool::new(false);
        gate.post().unwrap();
        wait_gate(&gate, &Shutdown::from_flag(&flag)).unwrap();
        assert_eq!(gate.value().unwrap(), 0);
    }

    #[test]
    fn requested_shutdown_skips_blocking() {
        let Some(gate) = gate_or_skip("skip") else { return };
        let flag = AtomicBool::new(true);
        let result = wait_gate(&gate, &Shutdown::from_flag(&flag));
        assert!(matches!(result, Err(WaitError::Interrupted(_))));
    }

    #[test]
    fn flag_alone_ends_a_blocked_wait() {
        let Some(gate) = gate_or_skip("flag") else { return };

        static FLAG: AtomicBool = AtomicBool::new(false);
        let opener = NamedSemaphore::<Opener>::open(gate.name()).unwrap();
        let (_tid, handle) = spawn_waiter(opener, &FLAG);
        assert!(!handle.is_finished());

        // no signal: the waiter has to notice the flag by itself
        FLAG.store(true, Ordering::SeqCst);
        let requested = std::time::Instant::now();
        while !handle.is_finished() && requested.elapsed() < Duration::from_secs(1) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_finished(), "waiter still blocked 1s after shutdown");

        let result = handle.join().expect("waiter");
        assert!(matches!(result, Err(WaitError::Interrupted(_))));
    }

    #[test]
    #[serial]
    fn benign_signal_is_retried() {
        let Some(gate) = gate_or_skip("benign") else { return };
        install_benign_handler();

        static FLAG: AtomicBool = AtomicBool::new(false);
        let opener = NamedSemaphore::<Opener>::open(gate.name()).unwrap();
        let (tid, handle) = spawn_waiter(opener, &FLAG);

        pthread_kill(tid, Signal::SIGUSR1).expect("pthread_kill");
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished(), "waiter gave up on a benign signal");

        gate.post().unwrap();
        handle.join().expect("waiter").expect("wait succeeds");
    }

    #[test]
    #[serial]
    fn shutdown_signal_ends_wait() {
        let Some(gate) = gate_or_skip("shutdown") else { return };
        install_benign_handler();

        static FLAG: AtomicBool = AtomicBool::new(false);
        let opener = NamedSemaphore::<Opener>::open(gate.name()).unwrap();
        let (tid, handle) = spawn_waiter(opener, &FLAG);

        FLAG.store(true, Ordering::SeqCst);
        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            let _ = pthread_kill(tid, Signal::SIGUSR1);
            thread::sleep(Duration::from_millis(10));
        }

        let result = handle.join().expect("waiter");
        assert!(matches!(result, Err(WaitError::Interrupted(_))));
    }
}
