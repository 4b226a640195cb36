//! Run configuration shared by both participants.
//!
//! Both sides must use the same `key_path`, `salt`, `prefix` and `shape`, or
//! the peer will not find the owner's resources. Values come from
//! [`Config::default`], optionally a TOML file, then command-line overrides.
//!
//! ```toml
//! key_path = "/tmp"
//! salt = 5
//! prefix = "tandem"
//! quota = 100000
//! shape = "directional"
//! attach_timeout_ms = 5000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Resource, TandemError};
use crate::gates::{GateNames, Shape};
use crate::ipc::IpcName;
use crate::segment::SegmentKey;

/// Default number of increments each participant performs.
pub const DEFAULT_QUOTA: u64 = 100_000;

/// Default salt mixed into the segment key.
pub const DEFAULT_SALT: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Existing path whose device/inode numbers seed the segment key.
    pub key_path: PathBuf,
    /// Salt mixed into the segment key.
    pub salt: u8,
    /// Prefix for every shared memory and semaphore name.
    pub prefix: String,
    /// Increments per participant (MANY).
    pub quota: u64,
    /// Gate layout and waiting discipline.
    pub shape: Shape,
    /// How long the peer keeps retrying to find the owner's resources.
    pub attach_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_path: PathBuf::from("/tmp"),
            salt: DEFAULT_SALT,
            prefix: "tandem".to_string(),
            quota: DEFAULT_QUOTA,
            shape: Shape::default(),
            attach_timeout_ms: 5_000,
        }
    }
}

impl Config {
    /// Reads a TOML file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, TandemError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TandemError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, TandemError> {
        toml::from_str(text).map_err(|e| TandemError::Config(e.to_string()))
    }

    /// Rejects configurations no run could complete with.
    pub fn validate(&self) -> Result<(), TandemError> {
        if self.quota == 0 {
            return Err(TandemError::Config("quota must be greater than 0".into()));
        }
        if self.quota.checked_mul(2).is_none() {
            return Err(TandemError::Config(format!(
                "quota {} overflows the combined total",
                self.quota
            )));
        }
        // probe every generated name with a placeholder key
        SegmentKey::from_parts(0, 0, self.salt).shm_name(&self.prefix)?;
        self.gate_names()?;
        Ok(())
    }

    /// Final counter value a complete run must reach.
    #[must_use]
    pub fn expected_total(&self) -> u64 {
        self.quota.saturating_mul(2)
    }

    #[must_use]
    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn segment_key(&self) -> Result<SegmentKey, TandemError> {
        SegmentKey::derive(&self.key_path, self.salt).map_err(|errno| {
            TandemError::SetupFailure {
                resource: Resource::KeyPath,
                name: self.key_path.display().to_string(),
                reason: format!("stat: {errno}"),
            }
        })
    }

    /// Name of the shared memory object, derived from `key_path` and `salt`.
    pub fn segment_name(&self) -> Result<IpcName, TandemError> {
        Ok(self.segment_key()?.shm_name(&self.prefix)?)
    }

    pub fn gate_names(&self) -> Result<GateNames, TandemError> {
        Ok(GateNames::with_prefix(&self.prefix)?)
    }
}
