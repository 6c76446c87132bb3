//! The compression toolset run inside the worker subprocess.
//!
//! The actual codecs live behind [`CompressionTool`]; the engine's job is to
//! run every registered tool over a job, time them, and keep the smallest
//! output. Embedding applications compile their real tools into the worker;
//! the built-in `store` tool guarantees the result is never larger than the
//! input, matching compression libraries that fall back to the original
//! buffer when no codec wins.

use std::time::Instant;
use tracing::{debug, warn};

use crate::core::{CompressionJob, CompressionOptions, CompressionOutcome, ToolResult, compression_ratio};
use crate::utils::{CompressorError, CompressorResult};

/// A single compression backend.
///
/// Implementations are treated as black boxes: synchronous, CPU-bound, and
/// free to fail on inputs they do not support (the engine skips failures).
pub trait CompressionTool: Send + Sync {
    /// Stable tool name, reported in per-tool statistics.
    fn name(&self) -> &str;

    /// Compresses `input` under `options`, returning the output bytes.
    fn compress(&self, input: &[u8], options: &CompressionOptions) -> CompressorResult<Vec<u8>>;
}

/// Lossless pass-through: stores the input unchanged.
///
/// Keeps the best-of selection well-defined when every real codec loses
/// against (or rejects) the input.
pub struct StoreTool;

impl CompressionTool for StoreTool {
    fn name(&self) -> &str {
        "store"
    }

    fn compress(&self, input: &[u8], _options: &CompressionOptions) -> CompressorResult<Vec<u8>> {
        Ok(input.to_vec())
    }
}

/// Runs every registered tool over a job and selects the best result.
pub struct Engine {
    tools: Vec<Box<dyn CompressionTool>>,
}

impl Engine {
    pub fn new(tools: Vec<Box<dyn CompressionTool>>) -> Self {
        Self { tools }
    }

    /// The toolset compiled into the shipped worker binary.
    pub fn with_default_tools() -> Self {
        Self::new(vec![Box::new(StoreTool)])
    }

    pub fn register(&mut self, tool: Box<dyn CompressionTool>) {
        self.tools.push(tool);
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Runs all tools over `job`.
    ///
    /// Tool failures are logged and skipped; the smallest successful output
    /// wins. Errors only when no tool produced a result at all.
    pub fn run(&self, job: &CompressionJob) -> CompressorResult<CompressionOutcome> {
        if self.tools.is_empty() {
            return Err(CompressorError::compression("no compression tools registered"));
        }

        let started = Instant::now();
        let original_size = job.image.len() as u64;
        let mut results: Vec<ToolResult> = Vec::with_capacity(self.tools.len());
        let mut best: Option<(usize, Vec<u8>)> = None;

        for tool in &self.tools {
            let tool_started = Instant::now();
            match tool.compress(&job.image, &job.options) {
                Ok(output) => {
                    let compressed_size = output.len() as u64;
                    debug!(
                        "{} produced {} bytes from {} for {}",
                        tool.name(),
                        compressed_size,
                        original_size,
                        job.filename
                    );
                    results.push(ToolResult {
                        tool: tool.name().to_string(),
                        original_size,
                        compressed_size,
                        compression_ratio: compression_ratio(original_size, compressed_size),
                        duration_ms: tool_started.elapsed().as_millis() as u64,
                    });
                    let wins = best
                        .as_ref()
                        .map(|(_, bytes)| output.len() < bytes.len())
                        .unwrap_or(true);
                    if wins {
                        best = Some((results.len() - 1, output));
                    }
                }
                Err(e) => {
                    warn!("tool {} failed for {}: {}", tool.name(), job.filename, e);
                }
            }
        }

        let Some((best_index, compressed)) = best else {
            return Err(CompressorError::compression(format!(
                "all compression tools failed for {}",
                job.filename
            )));
        };

        let best_tool = results[best_index].tool.clone();
        let best_ratio = results[best_index].compression_ratio;
        Ok(CompressionOutcome {
            best_tool,
            compression_ratio: best_ratio,
            total_duration_ms: started.elapsed().as_millis() as u64,
            all_results: results,
            compressed,
        })
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::with_default_tools()
    }
}
