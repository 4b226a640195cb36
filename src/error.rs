//! Protocol-level error taxonomy.
//!
//! The IPC layer reports raw errnos ([`ShmError`], [`SemError`]); this module
//! classifies them into what a participant can act on.

use rustix::io::Errno;

use crate::ipc::name::NameError;
use crate::ipc::sem::SemError;
use crate::ipc::shmem::ShmError;
use crate::protocol::Phase;

/// Which kind of named resource an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Segment,
    Gate,
    KeyPath,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Segment => "segment",
            Self::Gate => "gate",
            Self::KeyPath => "key path",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TandemError {
    /// The owner found the name already bound, usually left behind by a run
    /// that was killed without cleanup. Remove it with `tandem purge`.
    #[error("{resource} `{name}` already exists (stale from an earlier run? try `tandem purge`)")]
    ResourceAlreadyExists { resource: Resource, name: String },

    /// The peer looked for a name the owner has not created.
    #[error("{resource} `{name}` not found (is the owner running?)")]
    ResourceNotFound { resource: Resource, name: String },

    /// A shutdown request ended the run before it completed.
    #[error("interrupted during {phase}")]
    Interrupted { phase: Phase },

    #[error("{resource} `{name}`: {reason}")]
    SetupFailure {
        resource: Resource,
        name: String,
        reason: String,
    },

    #[error("configuration: {0}")]
    Config(String),
}

impl TandemError {
    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted { .. } => 1,
            Self::ResourceAlreadyExists { .. } => 2,
            Self::ResourceNotFound { .. } => 3,
            Self::SetupFailure { .. } | Self::Config(_) => 4,
        }
    }

    pub(crate) fn from_errno(resource: Resource, name: &str, errno: Errno, op: &str) -> Self {
        match errno {
            Errno::EXIST => Self::ResourceAlreadyExists {
                resource,
                name: name.to_string(),
            },
            Errno::NOENT => Self::ResourceNotFound {
                resource,
                name: name.to_string(),
            },
            other => Self::SetupFailure {
                resource,
                name: name.to_string(),
                reason: format!("{op}: {other}"),
            },
        }
    }

    pub(crate) fn from_shm(err: ShmError) -> Self {
        match err {
            ShmError::PosixError { op, name, source } => {
                Self::from_errno(Resource::Segment, &name, source, op)
            }
            ShmError::SizeMismatch {
                name,
                expected,
                actual,
            } => Self::SetupFailure {
                resource: Resource::Segment,
                name,
                reason: format!("size mismatch: expected {expected} bytes, got {actual}"),
            },
            ShmError::InvalidName(err) => Self::Config(err.to_string()),
        }
    }

    pub(crate) fn from_sem(err: SemError) -> Self {
        match err {
            SemError::PosixError { op, name, source } => {
                Self::from_errno(Resource::Gate, &name, source, op)
            }
            SemError::InvalidName(err) => Self::Config(err.to_string()),
        }
    }
}

impl From<ShmError> for TandemError {
    fn from(err: ShmError) -> Self {
        Self::from_shm(err)
    }
}

impl From<SemError> for TandemError {
    fn from(err: SemError) -> Self {
        Self::from_sem(err)
    }
}

impl From<NameError> for TandemError {
    fn from(err: NameError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classification() {
        let exists = TandemError::from_errno(Resource::Segment, "/x", Errno::EXIST, "shm_open");
        assert!(matches!(exists, TandemError::ResourceAlreadyExists { .. }));
        assert_eq!(exists.exit_code(), 2);

        let missing = TandemError::from_errno(Resource::Gate, "/x", Errno::NOENT, "sem_open");
        assert!(matches!(missing, TandemError::ResourceNotFound { .. }));
        assert_eq!(missing.exit_code(), 3);

        let other = TandemError::from_errno(Resource::Gate, "/x", Errno::ACCESS, "sem_open");
        assert!(matches!(other, TandemError::SetupFailure { .. }));
        assert_eq!(other.exit_code(), 4);
    }

    #[test]
    fn size_mismatch_is_setup_failure() {
        let err = TandemError::from(ShmError::SizeMismatch {
            name: "/x".into(),
            expected: 16,
            actual: 8,
        });
        assert!(matches!(err, TandemError::SetupFailure { resource: Resource::Segment, .. }));
    }

    #[test]
    fn interrupted_exits_one() {
        let err = TandemError::Interrupted {
            phase: Phase::Announced,
        };
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.to_string(), "interrupted during announced");
    }
}
