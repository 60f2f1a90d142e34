//! CLI rendering: run events as log lines and the final summary.

use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{info, warn};

use crate::core::{EventSubscriber, PackEvent, RunSummary};

/// Output mode for the run summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

/// JSON-serializable run summary
#[derive(Debug, Serialize)]
struct SummaryRecord<'a> {
    files_archived: u64,
    bytes_archived: u64,
    files_skipped: u64,
    batches: u64,
    oversize_batches: u64,
    uploads_succeeded: u64,
    uploads_failed: u64,
    files_deleted: u64,
    delete_failures: u64,
    failed_archives: Vec<String>,
    complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Writes the end-of-run summary to stdout
#[derive(Debug, Clone)]
pub struct OutputWriter {
    pub mode: OutputMode,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            mode: if json { OutputMode::Json } else { OutputMode::Human },
        }
    }

    /// Print the run summary
    pub fn run_summary(&self, summary: &RunSummary) {
        match self.mode {
            OutputMode::Json => {
                if let Ok(json) = serde_json::to_string(&summary_record(summary, None)) {
                    println!("{}", json);
                }
            }
            OutputMode::Human => {
                for line in summary_lines(summary) {
                    println!("{}", line);
                }
            }
        }
    }

    /// Print a fatal error
    pub fn error(&self, msg: &str) {
        match self.mode {
            OutputMode::Json => {
                let record = summary_record(&RunSummary::default(), Some(msg));
                if let Ok(json) = serde_json::to_string(&record) {
                    eprintln!("{}", json);
                }
            }
            OutputMode::Human => eprintln!("Error: {}", sanitize_error(msg)),
        }
    }
}

fn summary_record<'a>(summary: &RunSummary, error: Option<&'a str>) -> SummaryRecord<'a> {
    SummaryRecord {
        files_archived: summary.plan.files_archived,
        bytes_archived: summary.plan.bytes_archived,
        files_skipped: summary.plan.files_skipped,
        batches: summary.plan.batches_sealed,
        oversize_batches: summary.plan.oversize_batches,
        uploads_succeeded: summary.uploads_succeeded,
        uploads_failed: summary.uploads_failed,
        files_deleted: summary.files_deleted,
        delete_failures: summary.delete_failures,
        failed_archives: summary
            .failed_archives
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
        complete: error.is_none() && summary.is_complete(),
        error,
    }
}

/// Human-readable summary lines
pub fn summary_lines(summary: &RunSummary) -> Vec<String> {
    let plan = &summary.plan;
    let mut lines = vec![
        format!(
            "Archived {} files ({}) into {} archives",
            plan.files_archived,
            format_bytes(plan.bytes_archived),
            plan.batches_sealed
        ),
        format!(
            "Uploaded {}, failed {}, skipped {} files",
            summary.uploads_succeeded, summary.uploads_failed, plan.files_skipped
        ),
    ];
    if plan.oversize_batches > 0 {
        lines.push(format!(
            "{} archives hold a single file over the size limit",
            plan.oversize_batches
        ));
    }
    if summary.files_deleted > 0 || summary.delete_failures > 0 {
        lines.push(format!(
            "Deleted {} files, {} deletions failed",
            summary.files_deleted, summary.delete_failures
        ));
    }
    for archive in &summary.failed_archives {
        lines.push(format!("Kept for retry: {}", archive.display()));
    }
    lines
}

/// Render every run event through `tracing` until all publishers drop
pub fn spawn_event_logger(subscriber: EventSubscriber) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in subscriber.iter() {
            log_event(&event);
        }
    })
}

/// Log one event at the level it deserves
pub fn log_event(event: &PackEvent) {
    match event {
        PackEvent::ArchiveOpened { sequence, path, .. } => {
            info!("Opened archive #{} at {}", sequence, path.display());
        }
        PackEvent::CandidateSkipped { path, reason, .. } => {
            warn!("Skipped {}: {}", path.display(), reason);
        }
        PackEvent::ArchiveSealed {
            sequence,
            path,
            members,
            total_bytes,
            compressed_bytes,
            oversize,
            ..
        } => {
            info!(
                "Sealed archive #{} {}: {} files, {} -> {}{}",
                sequence,
                path.display(),
                members,
                format_bytes(*total_bytes),
                format_bytes(*compressed_bytes),
                if *oversize { " (over size limit)" } else { "" }
            );
        }
        PackEvent::ArchiveDiscarded {
            sequence,
            path,
            reason,
            ..
        } => {
            warn!(
                "Discarded archive #{} {}: {}",
                sequence,
                path.display(),
                reason
            );
        }
        PackEvent::UploadSucceeded {
            sequence,
            archive,
            remote_id,
            ..
        } => {
            info!(
                "Uploaded archive #{} {} as {}",
                sequence,
                archive.display(),
                remote_id
            );
        }
        PackEvent::UploadFailed {
            sequence,
            archive,
            error,
            ..
        } => {
            warn!(
                "Upload of archive #{} {} failed: {}",
                sequence,
                archive.display(),
                sanitize_error(error)
            );
        }
        PackEvent::FileDeleted { path, .. } => {
            info!("Deleted {}", path.display());
        }
        PackEvent::DeleteFailed { path, error, .. } => {
            warn!("Could not delete {}: {}", path.display(), error);
        }
        PackEvent::RunComplete {
            batches,
            uploads_failed,
            files_archived,
            files_skipped,
            ..
        } => {
            info!(
                "Run complete: {} archives, {} failed uploads, {} files archived, {} skipped",
                batches, uploads_failed, files_archived, files_skipped
            );
        }
    }
}

/// Sanitize error messages by collapsing whitespace
pub fn sanitize_error(msg: &str) -> String {
    msg.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let base = 1024.0_f64;
    let exp = (bytes_f.ln() / base.ln()).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);

    let value = bytes_f / base.powi(exp as i32);

    if exp == 0 {
        format!("{} {}", bytes, UNITS[exp])
    } else {
        format!("{:.2} {}", value, UNITS[exp])
    }
}
