//! Error taxonomy for filesystem operations
//!
//! Every fault surfaced by the cache carries one of these kinds. Only
//! `Io` is ever recovered locally (stale cached data bridges a remote
//! outage); everything else propagates to the caller.

use thiserror::Error;

/// Filesystem operation errors.
///
/// The path (or offending input) is carried in the variant so messages
/// read `"/a/b: does not exist"` without extra wrapping at call sites.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("{0}: does not exist")]
    NotExist(String),

    #[error("{0}: file already exists")]
    Exists(String),

    #[error("{0}: is a directory")]
    IsDir(String),

    #[error("{0}: not a directory")]
    NotDir(String),

    #[error("{0}: directory not empty")]
    NotEmpty(String),

    #[error("{0}: permission denied")]
    Perm(String),

    #[error("{0}: i/o error: {1}")]
    Io(String, String),

    #[error("{0}: bad path")]
    BadPath(String),

    #[error("{0}: not supported")]
    Unsupported(String),

    #[error("bad control request: {0}")]
    BadCtl(String),
}

impl FsError {
    /// True for transport failures, the only kind the cache may absorb.
    pub fn is_io(&self) -> bool {
        matches!(self, FsError::Io(..))
    }

    /// True when the target is missing or tombstoned.
    pub fn is_not_exist(&self) -> bool {
        matches!(self, FsError::NotExist(_))
    }

    /// Same error with the path context replaced.
    ///
    /// Used when a walk step fails on an inner element and the operation
    /// wants the full path in the report.
    pub fn at(self, path: &str) -> FsError {
        match self {
            FsError::NotExist(_) => FsError::NotExist(path.to_string()),
            FsError::Exists(_) => FsError::Exists(path.to_string()),
            FsError::IsDir(_) => FsError::IsDir(path.to_string()),
            FsError::NotDir(_) => FsError::NotDir(path.to_string()),
            FsError::NotEmpty(_) => FsError::NotEmpty(path.to_string()),
            FsError::Perm(_) => FsError::Perm(path.to_string()),
            FsError::Io(_, msg) => FsError::Io(path.to_string(), msg),
            FsError::BadPath(_) => FsError::BadPath(path.to_string()),
            FsError::Unsupported(_) => FsError::Unsupported(path.to_string()),
            e @ FsError::BadCtl(_) => e,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Io(String::new(), e.to_string())
    }
}
