//! Leftovers from runs that never got to release their resources.
//!
//! An owner killed with `SIGKILL` (or a crash) leaves its segment and gate
//! names bound, and the next owner then fails with
//! [`TandemError::ResourceAlreadyExists`]. [`inspect`] lists them and
//! [`purge`] removes them. Both look at every gate name, whatever the
//! configured shape.

use std::fmt;

use crate::config::Config;
use crate::error::{Resource, TandemError};
use crate::ipc::{IpcName, sem, shmem};
use crate::trace::info;

/// A named resource that currently exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleResource {
    pub resource: Resource,
    pub name: IpcName,
}

impl fmt::Display for StaleResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<8} {}", self.resource, self.name)
    }
}

fn candidates(config: &Config) -> Result<Vec<(Resource, IpcName)>, TandemError> {
    let mut all = vec![(Resource::Segment, config.segment_name()?)];
    all.extend(
        config
            .gate_names()?
            .iter()
            .map(|(_, name)| (Resource::Gate, name.clone())),
    );
    Ok(all)
}

/// Lists the segment and gate names for `config` that are currently bound.
pub fn inspect(config: &Config) -> Result<Vec<StaleResource>, TandemError> {
    let mut found = Vec::new();
    for (resource, name) in candidates(config)? {
        let present = match resource {
            Resource::Segment => shmem::exists(&name)?,
            _ => sem::exists(&name)?,
        };
        if present {
            found.push(StaleResource { resource, name });
        }
    }
    Ok(found)
}

/// Unlinks every segment and gate name for `config` and returns the ones
/// that were actually removed.
///
/// Processes that still hold handles keep working; the objects disappear
/// once they close them.
pub fn purge(config: &Config) -> Result<Vec<StaleResource>, TandemError> {
    let mut removed = Vec::new();
    for (resource, name) in candidates(config)? {
        let unlinked = match resource {
            Resource::Segment => shmem::unlink(&name)?,
            _ => sem::unlink(&name)?,
        };
        if unlinked {
            info!(%resource, %name, "removed stale resource");
            removed.push(StaleResource { resource, name });
        }
    }
    Ok(removed)
}
