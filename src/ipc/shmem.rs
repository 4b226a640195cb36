//! POSIX shared memory mapped as a typed value.
//!
//! [`Shm<T, Mode>`] maps exactly `size_of::<T>()` bytes of a named shared
//! memory object and hands out `&T` through [`Deref`]. The `Mode` typestate
//! decides what happens on drop:
//!
//! | Mode        | Construct               | On drop                      |
//! |-------------|-------------------------|------------------------------|
//! | [`Creator`] | `shm_open(O_CREAT\|O_EXCL)` | `munmap()` + `shm_unlink()` |
//! | [`Opener`]  | `shm_open(O_RDWR)`      | `munmap()` only              |
//!
//! Creation never reuses an existing object: a leftover name from a crashed
//! run surfaces as `EEXIST` and must be removed by an operator (see
//! [`crate::stale`]).
//!
//! ```no_run
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use tandem::ipc::{Creator, IpcName, Opener};
//! use tandem::ipc::shmem::{SharedMemorySafe, Shm};
//!
//! #[repr(C)]
//! #[derive(Default)]
//! struct Counter {
//!     value: AtomicU64,
//! }
//! unsafe impl SharedMemorySafe for Counter {}
//!
//! let name = IpcName::new("/my-counter").unwrap();
//! let owner = Shm::<Counter, Creator>::create(&name)?;
//! owner.value.store(42, Ordering::Release);
//!
//! let peer = Shm::<Counter, Opener>::open(&name)?;
//! assert_eq!(peer.value.load(Ordering::Acquire), 42);
//! # Ok::<(), tandem::ipc::shmem::ShmError>(())
//! ```

use rustix::fd::OwnedFd;
use rustix::fs::{Mode, fstat, ftruncate};
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::shm;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

use super::name::{IpcName, NameError};
use super::{Creator, Opener, Ownership};
use crate::trace::{debug, warn};

pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Shm`].
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("invalid shared memory name: {0}")]
    InvalidName(#[from] NameError),
    /// `shm_open`, `ftruncate`, `mmap`, etc. failed with an errno.
    #[error("{op} failed for `{name}`: {source}")]
    PosixError {
        op: &'static str,
        name: String,
        #[source]
        source: Errno,
    },
    /// The existing object does not have the size of `T`.
    #[error("shared memory `{name}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: i64,
    },
}

impl ShmError {
    fn posix(op: &'static str, name: &IpcName, source: Errno) -> Self {
        Self::PosixError {
            op,
            name: name.to_string(),
            source,
        }
    }

    /// The errno behind this error, if it came from a system call.
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::PosixError { source, .. } => Some(*source),
            _ => None,
        }
    }
}

/// Types that may live in POSIX shared memory.
///
/// # Safety
///
/// Implementers must guarantee:
/// - `#[repr(C)]` or `#[repr(transparent)]` layout, since both processes may
///   be compiled separately;
/// - no pointers, references or heap allocations;
/// - every field is itself `SharedMemorySafe`;
/// - soundness even if `Drop` never runs (a killed process skips it);
/// - concurrent access goes through atomics or an external lock.
///
/// `std::sync::Mutex` is process-local and does not qualify.
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Typed mapping of a named POSIX shared memory object.
///
/// # Safety Invariants
///
/// - `ptr` points to `size_of::<T>()` bytes obtained from `mmap()`
/// - the mapping stays valid until `Drop`
/// - `ptr` is page-aligned, which satisfies any `T`'s alignment
pub struct Shm<T: SharedMemorySafe, Mode: Ownership> {
    ptr: NonNull<T>,
    name: IpcName,
    _mode: PhantomData<Mode>,
}

// SAFETY: T: SharedMemorySafe requires Send + Sync; the pointer targets a
// shared mapping rather than thread-local data.
unsafe impl<T: SharedMemorySafe, Mode: Ownership> Send for Shm<T, Mode> {}

// SAFETY: see above.
unsafe impl<T: SharedMemorySafe, Mode: Ownership> Sync for Shm<T, Mode> {}

impl<T: SharedMemorySafe + Default> Shm<T, Creator> {
    /// Exclusively creates the object, sizes it for `T`, maps it, and writes
    /// `T::default()` into it.
    ///
    /// # Errors
    ///
    /// - `EEXIST`: the name is already bound (stale object from an earlier run)
    /// - `EACCES`, `ENOMEM`, `EMFILE`, `ENFILE`: resource or permission failures
    ///
    /// Any failure after `shm_open` succeeded unlinks the half-built object.
    ///
    /// # Panics
    ///
    /// Panics if `T::default()` panics; the object is unmapped and unlinked first.
    pub fn create(name: &IpcName) -> Result<Self> {
        let fd = shm::open(
            name.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", name, err))?;

        let ptr = ftruncate(&fd, size_of::<T>() as u64)
            .map_err(|err| ShmError::posix("ftruncate", name, err))
            .and_then(|()| map_shared::<T>(&fd, name))
            .inspect_err(|_| {
                // never leave a half-built object behind for a peer to find
                let _ = unlink(name);
            })?;

        let shm = Self {
            ptr,
            name: name.clone(),
            _mode: PhantomData,
        };

        // a panicking T::default() drops shm, which unmaps and unlinks
        match catch_unwind(AssertUnwindSafe(T::default)) {
            // SAFETY: ptr is a fresh writable mapping of size_of::<T>() bytes.
            Ok(value) => unsafe { shm.ptr.as_ptr().write(value) },
            Err(payload) => {
                drop(shm);
                resume_unwind(payload);
            }
        }

        debug!(name = %name, bytes = size_of::<T>(), "shared memory created");
        Ok(shm)
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Maps an object that another process created.
    ///
    /// # Errors
    ///
    /// - `ENOENT`: the object does not exist (yet)
    /// - [`ShmError::SizeMismatch`]: the object was created for a different layout
    pub fn open(name: &IpcName) -> Result<Self> {
        let fd = shm::open(name.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", name, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", name, err))?;
        if stat.st_size != size_of::<T>() as i64 {
            return Err(ShmError::SizeMismatch {
                name: name.to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        let ptr = map_shared::<T>(&fd, name)?;

        debug!(name = %name, "shared memory attached");
        Ok(Self {
            ptr,
            name: name.clone(),
            _mode: PhantomData,
        })
    }
}

/// Maps `size_of::<T>()` bytes of `fd` read-write and shared.
///
/// The caller must make sure the object is at least that large and that the
/// bytes hold a valid `T` before handing out references.
fn map_shared<T>(fd: &OwnedFd, name: &IpcName) -> Result<NonNull<T>> {
    // SAFETY: a new MAP_SHARED mapping; it aliases no Rust value in this
    // process.
    let addr = unsafe {
        mmap(
            null_mut(),
            size_of::<T>(),
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", name, err))?;
    NonNull::new(addr.cast::<T>()).ok_or_else(|| ShmError::posix("mmap", name, Errno::FAULT))
}

impl<T: SharedMemorySafe, Mode: Ownership> Shm<T, Mode> {
    #[must_use]
    pub fn name(&self) -> &IpcName {
        &self.name
    }
}

impl<T: SharedMemorySafe, Mode: Ownership> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from a successful mmap and nothing borrows
        // from self any more.
        if let Err(err) = unsafe { munmap(self.ptr.as_ptr().cast(), size_of::<T>()) } {
            warn!(name = %self.name, error = %err, "munmap failed");
        }

        if Mode::SHOULD_UNLINK {
            match unlink(&self.name) {
                Ok(true) => debug!(name = %self.name, "shared memory unlinked"),
                Ok(false) => debug!(name = %self.name, "shared memory name already gone"),
                Err(err) => warn!(name = %self.name, error = %err, "shm_unlink failed"),
            }
        } else {
            debug!(name = %self.name, "shared memory detached");
        }
    }
}

impl<T: SharedMemorySafe, Mode: Ownership> Deref for Shm<T, Mode> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the mapping is valid and initialized for the lifetime of self.
        unsafe { self.ptr.as_ref() }
    }
}

/// Returns whether a shared memory object with this name currently exists.
pub fn exists(name: &IpcName) -> Result<bool> {
    match shm::open(name.as_str(), shm::OFlags::RDONLY, Mode::empty()) {
        Ok(_fd) => Ok(true),
        Err(Errno::NOENT) => Ok(false),
        Err(err) => Err(ShmError::posix("shm_open", name, err)),
    }
}

/// Removes a shared memory name. Returns `false` if it did not exist.
pub fn unlink(name: &IpcName) -> Result<bool> {
    match shm::unlink(name.as_str()) {
        Ok(()) => Ok(true),
        Err(Errno::NOENT) => Ok(false),
        Err(err) => Err(ShmError::posix("shm_unlink", name, err)),
    }
}
