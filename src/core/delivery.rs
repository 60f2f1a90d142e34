/*!
 * Delivery: upload one sealed batch, then optionally clean up
 *
 * Upload success is final. A cleanup failure afterwards is reported but
 * never turns a delivered batch into a failed one. On upload failure
 * nothing is removed.
 */

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::archive::Batch;
use super::events::EventPublisher;
use crate::auth::AuthError;
use crate::sink::{TransportError, UploadSink};

/// What cleanup managed to remove after a confirmed upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Source files removed
    pub removed: Vec<PathBuf>,
    /// Paths that could not be removed, with the reason
    pub failed: Vec<(PathBuf, String)>,
    /// Whether the local archive artifact was removed
    pub archive_removed: bool,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered {
        remote_id: String,
        /// None when delete-after-send is off
        cleanup: Option<CleanupReport>,
    },
    Failed {
        reason: String,
        /// Set when the sink could not obtain credentials at all
        credentials: Option<AuthError>,
    },
}

/// Result of delivering one batch
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub batch: Batch,
    pub outcome: DeliveryOutcome,
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Delivered { .. })
    }

    pub fn remote_id(&self) -> Option<&str> {
        match &self.outcome {
            DeliveryOutcome::Delivered { remote_id, .. } => Some(remote_id),
            DeliveryOutcome::Failed { .. } => None,
        }
    }

    /// The credential failure behind a failed upload, if that was the cause
    pub fn credential_error(&self) -> Option<&AuthError> {
        match &self.outcome {
            DeliveryOutcome::Failed { credentials, .. } => credentials.as_ref(),
            DeliveryOutcome::Delivered { .. } => None,
        }
    }

    pub fn cleanup(&self) -> Option<&CleanupReport> {
        match &self.outcome {
            DeliveryOutcome::Delivered { cleanup, .. } => cleanup.as_ref(),
            DeliveryOutcome::Failed { .. } => None,
        }
    }
}

/// Hands sealed batches to an upload sink, one attempt each
pub struct DeliveryPipeline<S: UploadSink> {
    sink: S,
    destination: String,
    delete_after_send: bool,
    publisher: EventPublisher,
}

impl<S: UploadSink> DeliveryPipeline<S> {
    pub fn new(sink: S, destination: impl Into<String>, delete_after_send: bool) -> Self {
        Self {
            sink,
            destination: destination.into(),
            delete_after_send,
            publisher: EventPublisher::noop(),
        }
    }

    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Upload a batch and, on success, clean up if configured
    pub fn deliver(&self, batch: Batch) -> DeliveryResult {
        let archive = batch.archive_path().to_path_buf();
        debug!(
            "Uploading archive #{} ({}) via {}",
            batch.sequence(),
            archive.display(),
            self.sink.name()
        );

        match self.sink.upload(&archive, &self.destination) {
            Ok(remote_id) => {
                self.publisher
                    .on_upload_result(batch.sequence(), archive, Ok(&remote_id));
                let cleanup = self.delete_after_send.then(|| self.cleanup(&batch));
                DeliveryResult {
                    batch,
                    outcome: DeliveryOutcome::Delivered { remote_id, cleanup },
                }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(
                    "Upload of archive #{} failed, keeping {} and its {} source files: {}",
                    batch.sequence(),
                    archive.display(),
                    batch.members().len(),
                    reason
                );
                self.publisher
                    .on_upload_result(batch.sequence(), archive, Err(reason.clone()));
                let credentials = match e {
                    TransportError::Credentials(auth) => Some(auth),
                    _ => None,
                };
                DeliveryResult {
                    batch,
                    outcome: DeliveryOutcome::Failed {
                        reason,
                        credentials,
                    },
                }
            }
        }
    }

    /// Remove every member's source file, then the archive artifact
    fn cleanup(&self, batch: &Batch) -> CleanupReport {
        let mut report = CleanupReport::default();

        for member in batch.members() {
            match remove(&member.path) {
                Ok(()) => {
                    self.publisher.on_delete(member.path.clone());
                    report.removed.push(member.path.clone());
                }
                Err(e) => {
                    warn!("Failed to delete {}: {}", member.path.display(), e);
                    self.publisher
                        .on_delete_failed(member.path.clone(), e.to_string());
                    report.failed.push((member.path.clone(), e.to_string()));
                }
            }
        }

        let archive = batch.archive_path();
        match remove(archive) {
            Ok(()) => {
                self.publisher.on_delete(archive.to_path_buf());
                report.archive_removed = true;
            }
            Err(e) => {
                warn!("Failed to delete archive {}: {}", archive.display(), e);
                self.publisher
                    .on_delete_failed(archive.to_path_buf(), e.to_string());
                report.failed.push((archive.to_path_buf(), e.to_string()));
            }
        }

        report
    }
}

fn remove(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}
