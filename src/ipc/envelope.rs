use serde::{Deserialize, Serialize};
use crate::core::{CompressionJob, CompressionOutcome};

/// One framed message on the coordinator/worker channel.
///
/// Delivery is at-most-once and unordered across requests; pairing of a
/// `success`/`error` to its `request` is done solely through `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Handshake sentinel, sent once by the worker before its request loop.
    Ready,
    /// A compression job, coordinator → worker.
    Request { id: u64, job: CompressionJob },
    /// Successful job completion, worker → coordinator.
    Success { id: u64, outcome: CompressionOutcome },
    /// Job failure, worker → coordinator. `id` is absent when the inbound
    /// frame was malformed and no correlation id could be recovered.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        message: String,
    },
}

impl Envelope {
    /// Wire name of the envelope variant, for log messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Ready => "ready",
            Envelope::Request { .. } => "request",
            Envelope::Success { .. } => "success",
            Envelope::Error { .. } => "error",
        }
    }
}
