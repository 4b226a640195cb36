//! Typed wrappers over POSIX IPC objects.
//!
//! Both wrappers share the [`Creator`]/[`Opener`] typestate: the creator owns
//! the object name and unlinks it on release, the opener only closes its
//! handle.

pub mod name;
pub mod sem;
pub mod shmem;

pub use name::IpcName;

/// Trait defining cleanup behavior for IPC handles.
///
/// `Foo<Creator>` and `Foo<Opener>` are different types with different
/// release behavior, fixed at compile time:
///
/// ```text
/// Creator          Opener
///    ↓                ↓
///  close            close
///  unlink          (no unlink)
/// ```
pub trait Ownership {
    /// Whether releasing the handle also removes the name from the system.
    const SHOULD_UNLINK: bool;

    /// Short label used in logs.
    const LABEL: &'static str;
}

/// Typestate marker for the process that creates an IPC object.
///
/// Creation is exclusive (`O_CREAT | O_EXCL`); the name is unlinked when the
/// handle is released.
#[derive(Debug)]
pub struct Creator;

impl Ownership for Creator {
    const SHOULD_UNLINK: bool = true;
    const LABEL: &'static str = "creator";
}

/// Typestate marker for a process that opens an existing IPC object.
///
/// The name is left in place on release for the [`Creator`] to remove.
#[derive(Debug)]
pub struct Opener;

impl Ownership for Opener {
    const SHOULD_UNLINK: bool = false;
    const LABEL: &'static str = "opener";
}
