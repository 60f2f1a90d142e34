/*!
 * Capsule - pack a directory into size-bounded zip archives and ship them
 *
 * - Glob exclusions on bare file names
 * - Archives capped by cumulative uncompressed size
 * - Each sealed archive is uploaded before traversal continues
 * - Optional removal of the sources once an upload is confirmed
 * - Google Drive and local-directory sinks
 */

pub mod auth;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod output;
pub mod sink;

// Re-export commonly used types
pub use auth::{CredentialProvider, OAuthCredentialProvider, StaticTokenProvider};
pub use config::{CapsuleConfig, LogLevel, PackConfig};
pub use core::{
    is_excluded, pack_and_deliver, pack_and_deliver_into, Batch, BatchPlanner, DeliveryPipeline, DeliveryResult,
    EventPublisher, PackEvent, PlanSummary, RunSummary,
};
pub use error::{CapsuleError, Result};
pub use sink::{DriveSink, LocalDirSink, TransportError, UploadSink};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
