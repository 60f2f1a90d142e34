/*!
 * Core pack-and-deliver operations
 */

pub mod archive;
pub mod delivery;
pub mod events;
pub mod filter;
pub mod planner;
pub mod walk;

use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::error::{CapsuleError, Result, EXIT_PARTIAL, EXIT_SUCCESS};
use crate::sink::UploadSink;

pub use archive::{Archive, ArchiveBuilder, ArchiveState, Batch, CandidateFile};
pub use delivery::{CleanupReport, DeliveryOutcome, DeliveryPipeline, DeliveryResult};
pub use events::{EventPublisher, EventSubscriber, PackEvent, SkipReason};
pub use filter::{is_excluded, ExclusionFilter, ExclusionPattern, FilterError};
pub use planner::{BatchPlanner, PlanSummary};
pub use walk::{DirectoryWalker, FileStat, FsStat, WalkDirWalker, WalkEntry};

/// Statistics about a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub plan: PlanSummary,
    pub uploads_succeeded: u64,
    pub uploads_failed: u64,
    pub files_deleted: u64,
    pub delete_failures: u64,
    /// Archives whose upload failed and that were left on disk
    pub failed_archives: Vec<PathBuf>,
}

impl RunSummary {
    /// Every batch uploaded and every requested deletion succeeded
    pub fn is_complete(&self) -> bool {
        self.uploads_failed == 0 && self.delete_failures == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_complete() {
            EXIT_SUCCESS
        } else {
            EXIT_PARTIAL
        }
    }

    fn record(&mut self, result: &DeliveryResult) {
        match &result.outcome {
            DeliveryOutcome::Delivered { cleanup, .. } => {
                self.uploads_succeeded += 1;
                if let Some(report) = cleanup {
                    self.files_deleted += report.removed.len() as u64;
                    self.delete_failures += report.failed.len() as u64;
                }
            }
            DeliveryOutcome::Failed { .. } => {
                self.uploads_failed += 1;
                self.failed_archives
                    .push(result.batch.archive_path().to_path_buf());
            }
        }
    }
}

/// Plan `root` and deliver each batch the moment it is sealed.
///
/// A failed upload is recorded and the run moves on. Planning errors
/// (archive creation, writing, traversal root) and lost credentials end
/// the run early.
pub fn pack_and_deliver<W, T, S>(
    root: &Path,
    planner: &BatchPlanner<W, T>,
    pipeline: &DeliveryPipeline<S>,
) -> Result<RunSummary>
where
    W: DirectoryWalker,
    T: FileStat,
    S: UploadSink,
{
    let mut summary = RunSummary::default();
    pack_and_deliver_into(root, planner, pipeline, &mut summary)?;
    Ok(summary)
}

/// Same as [`pack_and_deliver`], but deliveries are recorded into `summary`
/// as they happen, so they remain visible when the run aborts.
pub fn pack_and_deliver_into<W, T, S>(
    root: &Path,
    planner: &BatchPlanner<W, T>,
    pipeline: &DeliveryPipeline<S>,
    summary: &mut RunSummary,
) -> Result<()>
where
    W: DirectoryWalker,
    T: FileStat,
    S: UploadSink,
{
    let plan = planner.plan(root, |batch| {
        debug!(
            "Delivering archive #{} with {} members",
            batch.sequence(),
            batch.members().len()
        );
        let result = pipeline.deliver(batch);
        summary.record(&result);
        match result.credential_error() {
            Some(e) => {
                error!("Cannot obtain credentials, stopping the run: {}", e);
                Err(CapsuleError::Authentication(e.clone()))
            }
            None => Ok(()),
        }
    })?;
    summary.plan = plan;

    pipeline.publisher().on_complete(
        summary.plan.batches_sealed,
        summary.uploads_failed,
        summary.plan.files_archived,
        summary.plan.files_skipped,
    );
    info!(
        "Run finished: {} batches, {} uploaded, {} failed",
        summary.plan.batches_sealed, summary.uploads_succeeded, summary.uploads_failed
    );

    Ok(())
}
