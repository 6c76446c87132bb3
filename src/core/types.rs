//! Core types for compression jobs, per-tool results, and service output.

use serde::{Deserialize, Serialize};

/// Options controlling a compression run.
///
/// Mirrors the options accepted by the compression tools: quality is a
/// fraction in `0.0..=1.0`, resize limits are optional pixel bounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionOptions {
    /// Compression quality (0-1); tools fall back to 0.6 when unset
    #[serde(default)]
    pub quality: Option<f32>,
    /// Maximum output width in pixels
    #[serde(default)]
    pub max_width: Option<u32>,
    /// Maximum output height in pixels
    #[serde(default)]
    pub max_height: Option<u32>,
    /// Whether EXIF metadata is carried over to the output
    #[serde(default)]
    pub preserve_exif: bool,
}

impl CompressionOptions {
    /// Default quality applied by tools when none was requested.
    pub const DEFAULT_QUALITY: f32 = 0.6;

    /// The quality a tool should actually use.
    pub fn effective_quality(&self) -> f32 {
        self.quality.unwrap_or(Self::DEFAULT_QUALITY)
    }
}

/// One compression job as handed to the worker subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionJob {
    /// Raw image bytes
    pub image: Vec<u8>,
    /// Original filename, used for artifact naming and progress reporting
    pub filename: String,
    /// Compression options
    #[serde(default)]
    pub options: CompressionOptions,
}

/// Result of running a single compression tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    /// Tool name
    pub tool: String,
    /// Input size in bytes
    pub original_size: u64,
    /// Output size in bytes
    pub compressed_size: u64,
    /// Size reduction as a percentage (negative if the file grew)
    pub compression_ratio: f64,
    /// Wall-clock time the tool took, in milliseconds
    pub duration_ms: u64,
}

/// Successful outcome of a compression job, as returned by the worker.
///
/// Carries the winning tool's output bytes plus statistics for every tool
/// that ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionOutcome {
    /// Name of the tool that produced the smallest output
    pub best_tool: String,
    /// The winning tool's output bytes
    pub compressed: Vec<u8>,
    /// The winning tool's size reduction, as a percentage
    pub compression_ratio: f64,
    /// Total time spent across all tools, in milliseconds
    pub total_duration_ms: u64,
    /// Per-tool statistics
    pub all_results: Vec<ToolResult>,
}

/// Service-level result of a completed compression.
///
/// The artifact itself stays on disk under the managed temp directory; the
/// `token` is the only handle callers receive for retrieving it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedImage {
    /// Opaque retrieval token for the stored artifact
    pub token: String,
    /// Name of the winning tool
    pub best_tool: String,
    /// Size reduction as a percentage
    pub compression_ratio: f64,
    /// Total compression time in milliseconds
    pub total_duration_ms: u64,
    /// Input size in bytes
    pub original_size: u64,
    /// Output size in bytes
    pub compressed_size: u64,
    /// Per-tool statistics
    pub all_results: Vec<ToolResult>,
}

/// Size reduction percentage for an original/compressed byte count pair.
pub fn compression_ratio(original_size: u64, compressed_size: u64) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    (original_size as f64 - compressed_size as f64) / original_size as f64 * 100.0
}
