//! Validated names for POSIX shared memory objects and named semaphores.

use std::ffi::CString;
use std::fmt;

/// Longest portable object name, including the leading slash.
pub const NAME_MAX: usize = 251;

/// Why a string was rejected as an IPC name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name must start with '/'")]
    MissingSlash,
    #[error("name must not contain additional '/' characters")]
    ExtraSlash,
    #[error("name must contain at least one character after '/'")]
    Empty,
    #[error("name must not contain NUL bytes")]
    Nul,
    #[error("name length must be <= {} bytes", NAME_MAX)]
    TooLong,
}

/// A name accepted by both `shm_open` and `sem_open`.
///
/// For portable use POSIX requires a leading `/`, no further slashes, and a
/// bounded length. Linux stores named semaphores as `sem.<name>` under
/// `/dev/shm`, so the bound is four bytes tighter than `NAME_MAX` for files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpcName(String);

impl IpcName {
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn to_cstring(&self) -> CString {
        // validate() rejects interior NULs
        CString::new(self.0.as_bytes()).unwrap_or_default()
    }
}

fn validate(name: &str) -> Result<(), NameError> {
    let Some(rest) = name.strip_prefix('/') else {
        return Err(NameError::MissingSlash);
    };
    if rest.is_empty() {
        return Err(NameError::Empty);
    }
    if rest.contains('/') {
        return Err(NameError::ExtraSlash);
    }
    if rest.contains('\0') {
        return Err(NameError::Nul);
    }
    if name.len() > NAME_MAX {
        return Err(NameError::TooLong);
    }
    Ok(())
}

impl fmt::Display for IpcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(IpcName::new("/valid").is_ok());
        assert!(IpcName::new("/tandem_mutex").is_ok());
        assert!(IpcName::new("/tandem-0005a1b2").is_ok());
    }

    #[test]
    fn rejects_missing_leading_slash() {
        assert_eq!(IpcName::new("no-slash"), Err(NameError::MissingSlash));
    }

    #[test]
    fn rejects_nested_slashes() {
        assert_eq!(IpcName::new("/foo/bar"), Err(NameError::ExtraSlash));
        assert_eq!(IpcName::new("/foo/bar/baz"), Err(NameError::ExtraSlash));
    }

    #[test]
    fn rejects_bare_slash() {
        assert_eq!(IpcName::new("/"), Err(NameError::Empty));
    }

    #[test]
    fn rejects_interior_nul() {
        assert_eq!(IpcName::new("/a\0b"), Err(NameError::Nul));
    }

    #[test]
    fn enforces_length_bound() {
        let max = format!("/{}", "a".repeat(NAME_MAX - 1));
        assert!(IpcName::new(max).is_ok());

        let long = format!("/{}", "a".repeat(NAME_MAX));
        assert_eq!(IpcName::new(long), Err(NameError::TooLong));
    }
}
