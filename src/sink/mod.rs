//! Upload sinks: where sealed archives go
//!
//! A sink gets exactly one `upload` call per batch. Retrying is the caller's
//! business, never the sink's.

mod drive;

pub use drive::{DriveSink, DRIVE_UPLOAD_URL};

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::auth::AuthError;

/// Upload failure, including HTTP and authorization errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Unauthorized (HTTP {status}): {body}")]
    Unauthorized { status: u16, body: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Credentials unavailable: {0}")]
    Credentials(#[from] AuthError),

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// Check if this error is related to authentication
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            TransportError::Unauthorized { .. } | TransportError::Credentials(_)
        )
    }

    /// Map a non-success HTTP status into an error
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => TransportError::Unauthorized { status, body },
            _ => TransportError::Http { status, body },
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Request(err.to_string())
    }
}

/// Persists a local archive remotely and returns its remote identifier
pub trait UploadSink {
    fn upload(
        &self,
        local_archive_path: &Path,
        destination_id: &str,
    ) -> Result<String, TransportError>;

    /// Short name used in logs
    fn name(&self) -> &str;
}

impl<S: UploadSink + ?Sized> UploadSink for Box<S> {
    fn upload(
        &self,
        local_archive_path: &Path,
        destination_id: &str,
    ) -> Result<String, TransportError> {
        (**self).upload(local_archive_path, destination_id)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Copies archives into `<base>/<destination_id>/`, never overwriting
#[derive(Debug, Clone)]
pub struct LocalDirSink {
    base: PathBuf,
}

impl LocalDirSink {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl UploadSink for LocalDirSink {
    fn upload(
        &self,
        local_archive_path: &Path,
        destination_id: &str,
    ) -> Result<String, TransportError> {
        let io_err = |path: &Path, source: io::Error| TransportError::Io {
            path: path.to_path_buf(),
            source,
        };

        let dest_dir = self.base.join(destination_id);
        fs::create_dir_all(&dest_dir).map_err(|e| io_err(&dest_dir, e))?;

        let file_name = local_archive_path.file_name().ok_or_else(|| {
            TransportError::InvalidResponse(format!(
                "archive path has no file name: {}",
                local_archive_path.display()
            ))
        })?;
        let target = dest_dir.join(file_name);

        let mut source = File::open(local_archive_path).map_err(|e| io_err(local_archive_path, e))?;
        let mut dest = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .map_err(|e| io_err(&target, e))?;
        let copied = io::copy(&mut source, &mut dest).map_err(|e| io_err(&target, e))?;
        dest.sync_all().map_err(|e| io_err(&target, e))?;

        debug!("Copied {} bytes to {}", copied, target.display());
        Ok(target.to_string_lossy().into_owned())
    }

    fn name(&self) -> &str {
        "local"
    }
}
