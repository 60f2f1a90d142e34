/*!
 * Error types for Capsule
 */

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::auth::AuthError;
use crate::core::filter::FilterError;
use crate::sink::TransportError;

pub type Result<T> = std::result::Result<T, CapsuleError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

/// The local storage step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    CreateArchive,
    OpenSource,
    ReadSource,
    WriteArchive,
    FinishArchive,
    RemoveFile,
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageOp::CreateArchive => write!(f, "creating archive"),
            StorageOp::OpenSource => write!(f, "opening source file"),
            StorageOp::ReadSource => write!(f, "reading source file"),
            StorageOp::WriteArchive => write!(f, "writing archive"),
            StorageOp::FinishArchive => write!(f, "finishing archive"),
            StorageOp::RemoveFile => write!(f, "removing"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CapsuleError {
    /// Malformed exclusion pattern
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    /// Local read/write/create failure
    #[error("Storage error while {op} '{}': {source}", path.display())]
    Storage {
        op: StorageOp,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// File vanished between discovery and processing
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Upload failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Credentials could not be obtained
    #[error("Authentication error: {0}")]
    Authentication(#[from] AuthError),

    /// Archive used outside its lifecycle (add after seal, seal twice)
    #[error("Invalid archive state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CapsuleError {
    pub(crate) fn storage(op: StorageOp, path: impl Into<PathBuf>, source: io::Error) -> Self {
        CapsuleError::Storage {
            op,
            path: path.into(),
            source,
        }
    }

    /// Check if this error must stop the whole run
    pub fn is_fatal(&self) -> bool {
        match self {
            CapsuleError::Storage { op, .. } => !matches!(
                op,
                StorageOp::OpenSource | StorageOp::ReadSource | StorageOp::RemoveFile
            ),
            CapsuleError::Authentication(_) => true,
            CapsuleError::InvalidState(_) => true,
            CapsuleError::Config(_) => true,
            CapsuleError::Io(_) => true,

            CapsuleError::Filter(_) => false,
            CapsuleError::NotFound(_) => false,
            CapsuleError::Transport(_) => false,
        }
    }

    /// Check if the underlying I/O failure is an exhausted disk
    pub fn is_disk_full(&self) -> bool {
        match self {
            CapsuleError::Storage { source, .. } | CapsuleError::Io(source) => {
                source.kind() == io::ErrorKind::StorageFull
            }
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            CapsuleError::Filter(_) => ErrorCategory::Filter,
            CapsuleError::Storage { .. } if self.is_disk_full() => ErrorCategory::Resource,
            CapsuleError::Storage { .. } | CapsuleError::Io(_) => ErrorCategory::Storage,
            CapsuleError::NotFound(_) => ErrorCategory::Filesystem,
            CapsuleError::Transport(_) => ErrorCategory::Network,
            CapsuleError::Authentication(_) => ErrorCategory::Security,
            CapsuleError::InvalidState(_) => ErrorCategory::Internal,
            CapsuleError::Config(_) => ErrorCategory::Configuration,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Exclusion pattern errors
    Filter,
    /// Local archive and source I/O
    Storage,
    /// Resource availability errors (disk space)
    Resource,
    /// Files changing underneath the scan
    Filesystem,
    /// Upload/transport errors
    Network,
    /// Authentication/authorization errors
    Security,
    /// Programming errors in archive lifecycle
    Internal,
    /// Configuration errors
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Filter => write!(f, "filter"),
            ErrorCategory::Storage => write!(f, "storage"),
            ErrorCategory::Resource => write!(f, "resource"),
            ErrorCategory::Filesystem => write!(f, "filesystem"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Security => write!(f, "security"),
            ErrorCategory::Internal => write!(f, "internal"),
            ErrorCategory::Configuration => write!(f, "configuration"),
        }
    }
}
