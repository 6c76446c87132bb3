//! Core data model shared by the coordinator, worker, and service layers.
//!
//! - [`CompressionJob`]: one unit of work handed to the worker subprocess
//! - [`CompressionOptions`]: quality/resize/EXIF settings for a job
//! - [`CompressionOutcome`]: the worker's reply, with per-tool statistics
//! - [`CompressedImage`]: the caller-facing result carrying the artifact token
//! - [`ProgressEvent`]: fire-and-forget notifications around a compression

mod progress;
mod types;

pub use progress::{ProgressBroadcaster, ProgressEvent, ProgressStatus};
pub use types::{
    CompressedImage, CompressionJob, CompressionOptions, CompressionOutcome, ToolResult,
    compression_ratio,
};
