//! Error types for mailindex operations
//!
//! All storage errors are represented by the IndexError enum, which carries
//! enough context (file path, byte offset, OS error code) for a caller to
//! render a meaningful message or decide whether to rebuild an index.

use std::path::PathBuf;

use thiserror::Error;

/// Mailindex error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum IndexError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", display_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Raw OS error code, when the failure came from a syscall
        os_code: Option<i32>,
        /// Human-readable description
        message: String,
    },

    /// Root block carries a different format/version tag
    #[error("Version mismatch in {}: expected {expected:?}, found {found:?}", .path.display())]
    BadVersion {
        /// File whose root block was checked
        path: PathBuf,
        /// Version tag requested by the opener
        expected: String,
        /// Version tag found on disk
        found: String,
    },

    /// On-disk structure is inconsistent
    #[error("Corrupt data in {} at offset {offset}: {reason}", .path.display())]
    Corrupt {
        /// File containing the bad structure
        path: PathBuf,
        /// Byte offset of the structure (block id or log offset)
        offset: u64,
        /// Description of the inconsistency
        reason: String,
    },

    /// Block id is zero, unaligned or past the end of the store
    #[error("Invalid block id {id:#x} (last {last:#x})")]
    InvalidBlockId {
        /// The rejected block id
        id: u32,
        /// The store's current end-of-file pointer
        last: u32,
    },

    /// Key exceeds the maximum storable length
    #[error("Key too large: {len} bytes exceeds limit of {max} bytes")]
    OversizedKey {
        /// Length of the rejected key
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Any other argument outside the accepted domain
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Mutation attempted on a file opened read-only
    #[error("{} is opened read-only", .path.display())]
    ReadOnly {
        /// The read-only file
        path: PathBuf,
    },

    /// Operation attempted after the file was deleted
    #[error("{} has been deleted", .path.display())]
    Deleted {
        /// Path the file had when it was deleted
        path: PathBuf,
    },

    /// A structural limit was hit
    #[error("{what} exhausted: limit {limit}")]
    ResourceExhausted {
        /// What ran out
        what: String,
        /// The limit that was reached
        limit: u64,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

impl IndexError {
    /// Wrap an I/O error with the file it happened on and what was being done.
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error, context: &str) -> Self {
        IndexError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            os_code: err.raw_os_error(),
            message: format!("{}: {}", context, err),
        }
    }

    /// Build a corruption error for a structure at `offset` in `path`.
    pub fn corrupt(path: impl Into<PathBuf>, offset: u64, reason: impl Into<String>) -> Self {
        IndexError::Corrupt {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// The OS error code preserved from the failing syscall, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            IndexError::Io { os_code, .. } => *os_code,
            _ => None,
        }
    }

    /// True for errors that indicate damaged on-disk data.
    pub fn is_corruption(&self) -> bool {
        matches!(self, IndexError::Corrupt { .. } | IndexError::BadVersion { .. })
    }
}

/// Convert std::io::Error to IndexError::Io
impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        IndexError::Io {
            path: None,
            kind: err.kind(),
            os_code: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for mailindex operations
pub type IndexResult<T> = Result<T, IndexError>;
