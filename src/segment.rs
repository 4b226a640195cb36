//! The shared counter segment and its identity.
//!
//! Layout (both participants must agree on it byte for byte):
//!
//! ```text
//! offset  field          type
//! 0       counter        AtomicU64   guarded by the mutex gate
//! 8       owner_done     AtomicBool  written by the owner only
//! 9       owner_started  AtomicBool  written by the owner only
//! 10      peer_started   AtomicBool  written by the peer only
//! 11      peer_done      AtomicBool  written by the peer only
//! 12..16  padding
//! ```

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rustix::io::Errno;

use crate::ipc::IpcName;
use crate::ipc::shmem::SharedMemorySafe;
use crate::protocol::Role;

/// Counter plus single-writer liveness and completion flags.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SharedCounter {
    counter: AtomicU64,
    owner_done: AtomicBool,
    owner_started: AtomicBool,
    peer_started: AtomicBool,
    peer_done: AtomicBool,
}

// SAFETY: repr(C), only atomics, no pointers, nothing relies on Drop.
unsafe impl SharedMemorySafe for SharedCounter {}

impl SharedCounter {
    /// Current counter value.
    ///
    /// Exact only while holding the mutex gate or after the peer's done gate
    /// was observed; otherwise a snapshot that may already be stale.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Adds one as a separate load and store.
    ///
    /// Not atomic as a whole: concurrent callers lose updates unless they
    /// serialize through the mutex gate.
    pub fn increment_unguarded(&self) {
        let value = self.counter.load(Ordering::Acquire);
        self.counter.store(value.wrapping_add(1), Ordering::Release);
    }

    pub fn mark_started(&self, role: Role) {
        self.started_flag(role).store(true, Ordering::Release);
    }

    pub fn mark_done(&self, role: Role) {
        self.done_flag(role).store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_started(&self, role: Role) -> bool {
        self.started_flag(role).load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_done(&self, role: Role) -> bool {
        self.done_flag(role).load(Ordering::Acquire)
    }

    /// Unsynchronized copy of every field, for reporting.
    #[must_use]
    pub fn snapshot(&self) -> SegmentSnapshot {
        SegmentSnapshot {
            counter: self.counter(),
            owner_started: self.is_started(Role::Owner),
            owner_done: self.is_done(Role::Owner),
            peer_started: self.is_started(Role::Peer),
            peer_done: self.is_done(Role::Peer),
        }
    }

    fn started_flag(&self, role: Role) -> &AtomicBool {
        match role {
            Role::Owner => &self.owner_started,
            Role::Peer => &self.peer_started,
        }
    }

    fn done_flag(&self, role: Role) -> &AtomicBool {
        match role {
            Role::Owner => &self.owner_done,
            Role::Peer => &self.peer_done,
        }
    }
}

/// Point-in-time view of a [`SharedCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSnapshot {
    pub counter: u64,
    pub owner_started: bool,
    pub owner_done: bool,
    pub peer_started: bool,
    pub peer_done: bool,
}

/// Segment identity both participants compute without talking to each other.
///
/// Same formula as System V `ftok(3)`: low 8 bits of the salt, low 8 bits of
/// the device number, low 16 bits of the inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentKey(u32);

impl SegmentKey {
    /// Derives the key from an existing filesystem path and a salt.
    pub fn derive(path: impl AsRef<Path>, salt: u8) -> Result<Self, Errno> {
        let stat = rustix::fs::stat(path.as_ref())?;
        Ok(Self::from_parts(stat.st_dev as u64, stat.st_ino as u64, salt))
    }

    #[must_use]
    pub const fn from_parts(dev: u64, ino: u64, salt: u8) -> Self {
        Self(((salt as u32) << 24) | (((dev & 0xff) as u32) << 16) | ((ino & 0xffff) as u32))
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Shared memory object name for this key: `/<prefix>-<key:08x>`.
    pub fn shm_name(self, prefix: &str) -> Result<IpcName, crate::ipc::name::NameError> {
        IpcName::new(format!("/{prefix}-{self}"))
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn layout_is_fixed() {
        assert_eq!(offset_of!(SharedCounter, counter), 0);
        assert_eq!(offset_of!(SharedCounter, owner_done), 8);
        assert_eq!(offset_of!(SharedCounter, owner_started), 9);
        assert_eq!(offset_of!(SharedCounter, peer_started), 10);
        assert_eq!(offset_of!(SharedCounter, peer_done), 11);
        assert_eq!(size_of::<SharedCounter>(), 16);
    }

    #[test]
    fn default_is_zeroed() {
        let shared = SharedCounter::default();
        let snap = shared.snapshot();
        assert_eq!(
            snap,
            SegmentSnapshot {
                counter: 0,
                owner_started: false,
                owner_done: false,
                peer_started: false,
                peer_done: false,
            }
        );
    }

    #[test]
    fn flags_are_per_role() {
        let shared = SharedCounter::default();
        shared.mark_started(Role::Peer);
        shared.mark_done(Role::Owner);

        assert!(shared.is_started(Role::Peer));
        assert!(!shared.is_started(Role::Owner));
        assert!(shared.is_done(Role::Owner));
        assert!(!shared.is_done(Role::Peer));
    }

    #[test]
    fn increment_counts_up() {
        let shared = SharedCounter::default();
        for _ in 0..5 {
            shared.increment_unguarded();
        }
        assert_eq!(shared.counter(), 5);
    }

    #[test]
    fn key_matches_ftok_formula() {
        let key = SegmentKey::from_parts(0x0803, 0x0012_3456, 5);
        assert_eq!(key.as_u32(), 0x0503_3456);
        assert_eq!(key.to_string(), "05033456");
    }

    #[test]
    fn key_is_stable_for_same_path() {
        let dir = env!("CARGO_MANIFEST_DIR");
        let a = SegmentKey::derive(dir, 5).unwrap();
        let b = SegmentKey::derive(dir, 5).unwrap();
        let c = SegmentKey::derive(dir, 6).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn key_requires_existing_path() {
        let err = SegmentKey::derive("/definitely/not/a/real/path", 5).unwrap_err();
        assert_eq!(err, Errno::NOENT);
    }

    #[test]
    fn shm_name_embeds_key() {
        let key = SegmentKey::from_parts(1, 2, 5);
        assert_eq!(key.shm_name("tandem").unwrap().as_str(), "/tandem-05010002");
    }
}
