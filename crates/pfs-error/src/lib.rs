#![forbid(unsafe_code)]
//! Error types for PFS.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `pfs-types` | Byte-level decode failures of on-disk records |
//! | Runtime | `PfsError` | `pfs-error` (this crate) | Errors returned by allocator, mapper, directory and volume operations |
//!
//! `pfs-error` does not depend on `pfs-types`. `pfs-ondisk` converts a
//! `ParseError` into `PfsError::Corruption` when the failing block is known
//! and into `PfsError::Format` while a volume is being opened.
//!
//! ## Distinguishable outcomes
//!
//! - Pool exhaustion is `NoSpace` and never an I/O error, so callers can
//!   report "no space" instead of a device failure.
//! - A directory lookup miss is not an error inside the directory engine
//!   (`Ok(None)`); the volume layer turns it into `NotFound`.
//! - `NameTooLong` and `InvalidRange` are raised before anything is mutated.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` / `Parse` / `InvalidGeometry` / `InvalidRange` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `PermissionDenied` | `EACCES` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `Exists` | `EEXIST` |
//! | `FileTooLarge` | `EFBIG` |
//! | `TooManyLinks` | `EMLINK` |

use thiserror::Error;

/// Unified error type for all PFS operations.
#[derive(Debug, Error)]
pub enum PfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata is inconsistent at a known device block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Not a PFS volume, or the header cannot be accepted.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Format parameters or device geometry out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Logical index, offset or resource number outside its valid range.
    #[error("out of range: {0}")]
    InvalidRange(String),

    /// A free pool is exhausted.
    #[error("no space left on device")]
    NoSpace,

    /// File, directory, or other named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backing device cannot be written.
    #[error("permission denied")]
    PermissionDenied,

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// rmdir, or rename over a directory, that still has entries.
    #[error("directory not empty")]
    NotEmpty,

    /// Filename is empty or longer than 255 bytes.
    #[error("name too long")]
    NameTooLong,

    /// Target already exists (create, mkdir, link).
    #[error("file exists")]
    Exists,

    /// Write would grow a file past the maximum file size.
    #[error("file too large")]
    FileTooLarge,

    /// Link count would overflow the on-disk field.
    #[error("too many links")]
    TooManyLinks,
}

impl PfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant without assigning its
    /// errno is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) | Self::InvalidRange(_) => {
                libc::EINVAL
            }
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::FileTooLarge => libc::EFBIG,
            Self::TooManyLinks => libc::EMLINK,
        }
    }

    /// Shorthand for a [`PfsError::Corruption`] at `block`.
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }

    /// True for `NoSpace`, which callers report differently from I/O failure.
    #[must_use]
    pub fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace)
    }
}

/// Result alias using `PfsError`.
pub type Result<T> = std::result::Result<T, PfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(PfsError, libc::c_int)> = vec![
            (PfsError::Io(std::io::Error::other("test")), libc::EIO),
            (PfsError::corruption(7, "chain loop"), libc::EIO),
            (PfsError::Format("bad magic".into()), libc::EINVAL),
            (PfsError::Parse("short".into()), libc::EINVAL),
            (PfsError::InvalidGeometry("sectors=10".into()), libc::EINVAL),
            (PfsError::InvalidRange("block 2^40".into()), libc::EINVAL),
            (PfsError::NoSpace, libc::ENOSPC),
            (PfsError::NotFound("x".into()), libc::ENOENT),
            (PfsError::PermissionDenied, libc::EACCES),
            (PfsError::NotDirectory, libc::ENOTDIR),
            (PfsError::IsDirectory, libc::EISDIR),
            (PfsError::NotEmpty, libc::ENOTEMPTY),
            (PfsError::NameTooLong, libc::ENAMETOOLONG),
            (PfsError::Exists, libc::EEXIST),
            (PfsError::FileTooLarge, libc::EFBIG),
            (PfsError::TooManyLinks, libc::EMLINK),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(PfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn no_space_is_distinct_from_io() {
        let exhausted = PfsError::NoSpace;
        let io = PfsError::Io(std::io::Error::other("device gone"));
        assert!(exhausted.is_no_space());
        assert!(!io.is_no_space());
        assert_ne!(exhausted.to_errno(), io.to_errno());
    }

    #[test]
    fn display_formatting() {
        let err = PfsError::corruption(42, "hash chain loops");
        assert_eq!(err.to_string(), "corrupt metadata at block 42: hash chain loops");
        assert_eq!(PfsError::NoSpace.to_string(), "no space left on device");
        assert_eq!(
            PfsError::InvalidRange("logical block 4294967296".into()).to_string(),
            "out of range: logical block 4294967296"
        );
    }
}
