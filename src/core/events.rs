/*!
 * Run event publisher
 *
 * The core never prints. Every skip, seal, upload and deletion is published
 * as a `PackEvent`; the CLI subscribes and renders them as log lines.
 */

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Why a discovered file did not make it into an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Matched an exclusion pattern
    Excluded { pattern: String },
    /// Disappeared between discovery and archiving
    Vanished,
    /// Could not be stat'ed, opened or read
    Unreadable(String),
    /// Traversal could not read a directory entry
    WalkError(String),
    /// Lives inside the staging directory
    StagingArea,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Excluded { pattern } => write!(f, "excluded by '{}'", pattern),
            SkipReason::Vanished => write!(f, "file vanished"),
            SkipReason::Unreadable(msg) => write!(f, "unreadable: {}", msg),
            SkipReason::WalkError(msg) => write!(f, "traversal error: {}", msg),
            SkipReason::StagingArea => write!(f, "inside staging directory"),
        }
    }
}

/// Run event types
#[derive(Debug, Clone)]
pub enum PackEvent {
    ArchiveOpened {
        sequence: u32,
        path: PathBuf,
        timestamp: u64,
    },

    CandidateSkipped {
        path: PathBuf,
        reason: SkipReason,
        timestamp: u64,
    },

    ArchiveSealed {
        sequence: u32,
        path: PathBuf,
        members: usize,
        total_bytes: u64,
        compressed_bytes: u64,
        /// Single member larger than the bound
        oversize: bool,
        timestamp: u64,
    },

    /// Archive abandoned and removed (members re-staged or none left)
    ArchiveDiscarded {
        sequence: u32,
        path: PathBuf,
        reason: String,
        timestamp: u64,
    },

    UploadSucceeded {
        sequence: u32,
        archive: PathBuf,
        remote_id: String,
        timestamp: u64,
    },

    UploadFailed {
        sequence: u32,
        archive: PathBuf,
        error: String,
        timestamp: u64,
    },

    FileDeleted {
        path: PathBuf,
        timestamp: u64,
    },

    DeleteFailed {
        path: PathBuf,
        error: String,
        timestamp: u64,
    },

    RunComplete {
        batches: u64,
        uploads_failed: u64,
        files_archived: u64,
        files_skipped: u64,
        timestamp: u64,
    },
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Event publisher - sends events to a subscriber
#[derive(Clone)]
pub struct EventPublisher {
    sender: Option<Sender<PackEvent>>,
}

impl EventPublisher {
    /// Create a new publisher with bounded channel
    pub fn new(buffer_size: usize) -> (Self, EventSubscriber) {
        let (tx, rx) = bounded(buffer_size);
        (
            EventPublisher { sender: Some(tx) },
            EventSubscriber { receiver: rx },
        )
    }

    /// Create a new publisher with unbounded channel
    pub fn unbounded() -> (Self, EventSubscriber) {
        let (tx, rx) = unbounded();
        (
            EventPublisher { sender: Some(tx) },
            EventSubscriber { receiver: rx },
        )
    }

    /// Create a no-op publisher
    pub fn noop() -> Self {
        EventPublisher { sender: None }
    }

    /// Publish an event
    pub fn publish(&self, event: PackEvent) {
        if let Some(ref tx) = self.sender {
            let _ = tx.send(event); // subscriber may have dropped
        }
    }

    pub fn on_open(&self, sequence: u32, path: PathBuf) {
        self.publish(PackEvent::ArchiveOpened {
            sequence,
            path,
            timestamp: current_timestamp(),
        });
    }

    pub fn on_skip(&self, path: PathBuf, reason: SkipReason) {
        self.publish(PackEvent::CandidateSkipped {
            path,
            reason,
            timestamp: current_timestamp(),
        });
    }

    pub fn on_seal(
        &self,
        sequence: u32,
        path: PathBuf,
        members: usize,
        total_bytes: u64,
        compressed_bytes: u64,
        oversize: bool,
    ) {
        self.publish(PackEvent::ArchiveSealed {
            sequence,
            path,
            members,
            total_bytes,
            compressed_bytes,
            oversize,
            timestamp: current_timestamp(),
        });
    }

    pub fn on_discard(&self, sequence: u32, path: PathBuf, reason: String) {
        self.publish(PackEvent::ArchiveDiscarded {
            sequence,
            path,
            reason,
            timestamp: current_timestamp(),
        });
    }

    pub fn on_upload_result(
        &self,
        sequence: u32,
        archive: PathBuf,
        result: std::result::Result<&str, String>,
    ) {
        let timestamp = current_timestamp();
        self.publish(match result {
            Ok(remote_id) => PackEvent::UploadSucceeded {
                sequence,
                archive,
                remote_id: remote_id.to_string(),
                timestamp,
            },
            Err(error) => PackEvent::UploadFailed {
                sequence,
                archive,
                error,
                timestamp,
            },
        });
    }

    pub fn on_delete(&self, path: PathBuf) {
        self.publish(PackEvent::FileDeleted {
            path,
            timestamp: current_timestamp(),
        });
    }

    pub fn on_delete_failed(&self, path: PathBuf, error: String) {
        self.publish(PackEvent::DeleteFailed {
            path,
            error,
            timestamp: current_timestamp(),
        });
    }

    pub fn on_complete(
        &self,
        batches: u64,
        uploads_failed: u64,
        files_archived: u64,
        files_skipped: u64,
    ) {
        self.publish(PackEvent::RunComplete {
            batches,
            uploads_failed,
            files_archived,
            files_skipped,
            timestamp: current_timestamp(),
        });
    }
}

/// Event subscriber - receives events
pub struct EventSubscriber {
    receiver: Receiver<PackEvent>,
}

impl EventSubscriber {
    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Option<PackEvent> {
        self.receiver.try_recv().ok()
    }

    /// Blocking iterator that ends when every publisher is dropped
    pub fn iter(&self) -> impl Iterator<Item = PackEvent> + '_ {
        self.receiver.iter()
    }

    /// Collect whatever is queued right now
    pub fn drain(&self) -> Vec<PackEvent> {
        self.receiver.try_iter().collect()
    }
}
