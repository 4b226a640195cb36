//! POSIX named semaphores with the same creator/opener typestate as
//! [`Shm`](super::shmem::Shm).
//!
//! `sem_open` and friends have no rustix binding, so this module talks to
//! `libc` directly and reports failures as [`rustix::io::Errno`] like the rest
//! of the IPC layer.
//!
//! | Mode        | Construct                          | On drop                      |
//! |-------------|------------------------------------|------------------------------|
//! | [`Creator`] | `sem_open(O_CREAT\|O_EXCL, value)` | `sem_close()` + `sem_unlink()` |
//! | [`Opener`]  | `sem_open(0)`                      | `sem_close()` only           |

use rustix::io::Errno;
use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::time::Duration;

use super::name::{IpcName, NameError};
use super::{Creator, Opener, Ownership};
use crate::trace::{debug, trace, warn};

pub type Result<T> = std::result::Result<T, SemError>;

const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, thiserror::Error)]
pub enum SemError {
    #[error("invalid semaphore name: {0}")]
    InvalidName(#[from] NameError),
    #[error("{op} failed for `{name}`: {source}")]
    PosixError {
        op: &'static str,
        name: String,
        #[source]
        source: Errno,
    },
}

impl SemError {
    fn posix(op: &'static str, name: &IpcName, source: Errno) -> Self {
        Self::PosixError {
            op,
            name: name.to_string(),
            source,
        }
    }

    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::PosixError { source, .. } => Some(*source),
            Self::InvalidName(_) => None,
        }
    }
}

fn last_errno() -> Errno {
    Errno::from_io_error(&io::Error::last_os_error()).unwrap_or(Errno::IO)
}

/// Absolute `CLOCK_REALTIME` time `timeout` from now, as `sem_timedwait`
/// expects it.
fn realtime_deadline(timeout: Duration) -> std::result::Result<libc::timespec, Errno> {
    // SAFETY: timespec is plain data; all-zero is a valid value.
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    // SAFETY: now is a valid out pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(last_errno());
    }

    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    let secs = timeout.as_secs().saturating_add(nanos / NANOS_PER_SEC);
    let mut deadline = now;
    deadline.tv_sec = now
        .tv_sec
        .saturating_add(libc::time_t::try_from(secs).unwrap_or(libc::time_t::MAX));
    deadline.tv_nsec = (nanos % NANOS_PER_SEC) as _;
    Ok(deadline)
}

/// Handle to a named, kernel-managed counting semaphore.
pub struct NamedSemaphore<Mode: Ownership> {
    sem: NonNull<libc::sem_t>,
    name: IpcName,
    _mode: PhantomData<Mode>,
}

// SAFETY: sem_t handles returned by sem_open are process-wide and every
// operation on them is thread-safe.
unsafe impl<Mode: Ownership> Send for NamedSemaphore<Mode> {}

// SAFETY: see above.
unsafe impl<Mode: Ownership> Sync for NamedSemaphore<Mode> {}

impl NamedSemaphore<Creator> {
    /// Exclusively creates a semaphore with `initial` permits.
    ///
    /// # Errors
    ///
    /// `EEXIST` if the name is already bound, `EACCES`/`ENOSPC`/`EMFILE` on
    /// resource failures, `EINVAL` if `initial` exceeds `SEM_VALUE_MAX`.
    pub fn create(name: &IpcName, initial: u32) -> Result<Self> {
        let cname = name.to_cstring();
        // SAFETY: cname is a valid C string; mode and value are passed as the
        // variadic mode_t and unsigned int sem_open expects with O_CREAT.
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::mode_t,
                initial as libc::c_uint,
            )
        };
        let sem = Self::checked(sem, name)?;
        debug!(name = %name, initial, "semaphore created");
        Ok(sem)
    }
}

impl NamedSemaphore<Opener> {
    /// Opens a semaphore created by another process.
    ///
    /// # Errors
    ///
    /// `ENOENT` if no semaphore with this name exists.
    pub fn open(name: &IpcName) -> Result<Self> {
        let cname = name.to_cstring();
        // SAFETY: cname is a valid C string; without O_CREAT no variadic
        // arguments are read.
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        let sem = Self::checked(sem, name)?;
        debug!(name = %name, "semaphore opened");
        Ok(sem)
    }
}

impl<Mode: Ownership> NamedSemaphore<Mode> {
    fn checked(sem: *mut libc::sem_t, name: &IpcName) -> Result<Self> {
        if sem == libc::SEM_FAILED {
            return Err(SemError::posix("sem_open", name, last_errno()));
        }
        let sem = NonNull::new(sem).ok_or_else(|| SemError::posix("sem_open", name, Errno::FAULT))?;
        Ok(Self {
            sem,
            name: name.clone(),
            _mode: PhantomData,
        })
    }

    #[must_use]
    pub fn name(&self) -> &IpcName {
        &self.name
    }

    /// Releases one permit.
    pub fn post(&self) -> Result<()> {
        // SAFETY: self.sem is a live handle from sem_open.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == 0 {
            trace!(name = %self.name, "post");
            Ok(())
        } else {
            Err(SemError::posix("sem_post", &self.name, last_errno()))
        }
    }

    /// Takes a permit, blocking for at most `timeout`. Returns `false` if
    /// none became available in time; a zero timeout only polls.
    ///
    /// A signal delivered to this thread while it is blocked ends the call
    /// with `EINTR`; retrying is the caller's decision
    /// (see [`crate::wait::wait_gate`]).
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = realtime_deadline(timeout)
            .map_err(|err| SemError::posix("clock_gettime", &self.name, err))?;
        // SAFETY: self.sem is a live handle and deadline a valid timespec.
        if unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) } == 0 {
            trace!(name = %self.name, "wait satisfied");
            return Ok(true);
        }
        match last_errno() {
            Errno::TIMEDOUT => Ok(false),
            err => Err(SemError::posix("sem_timedwait", &self.name, err)),
        }
    }

    /// Current permit count. Racy by nature; useful for diagnostics and tests.
    pub fn value(&self) -> Result<i32> {
        let mut value: libc::c_int = 0;
        // SAFETY: self.sem is live and value is a valid out pointer.
        if unsafe { libc::sem_getvalue(self.sem.as_ptr(), &mut value) } == 0 {
            Ok(value)
        } else {
            Err(SemError::posix("sem_getvalue", &self.name, last_errno()))
        }
    }
}

impl<Mode: Ownership> Drop for NamedSemaphore<Mode> {
    fn drop(&mut self) {
        // SAFETY: the handle is live and no borrow of self outlives drop.
        if unsafe { libc::sem_close(self.sem.as_ptr()) } != 0 {
            warn!(name = %self.name, error = %last_errno(), "sem_close failed");
        }

        if Mode::SHOULD_UNLINK {
            match unlink(&self.name) {
                Ok(true) => debug!(name = %self.name, "semaphore unlinked"),
                Ok(false) => debug!(name = %self.name, "semaphore name already gone"),
                Err(err) => warn!(name = %self.name, error = %err, "sem_unlink failed"),
            }
        } else {
            debug!(name = %self.name, "semaphore closed");
        }
    }
}

/// Returns whether a named semaphore currently exists.
pub fn exists(name: &IpcName) -> Result<bool> {
    match NamedSemaphore::<Opener>::open(name) {
        Ok(_sem) => Ok(true),
        Err(err) if err.errno() == Some(Errno::NOENT) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Removes a semaphore name. Returns `false` if it did not exist.
///
/// Open handles keep working; the semaphore is destroyed once the last one is
/// closed.
pub fn unlink(name: &IpcName) -> Result<bool> {
    let cname = name.to_cstring();
    // SAFETY: cname is a valid C string.
    if unsafe { libc::sem_unlink(cname.as_ptr()) } == 0 {
        return Ok(true);
    }
    match last_errno() {
        Errno::NOENT => Ok(false),
        err => Err(SemError::posix("sem_unlink", name, err)),
    }
}
