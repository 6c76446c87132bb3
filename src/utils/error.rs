//! Error types for the compression service.
//!
//! Provides a single error hierarchy using `thiserror` covering coordinator,
//! channel, registry, and worker failures.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the compression service.
///
/// Coordinator-facing failures surface as this type through returned futures;
/// the resource gate maps its own outcomes to HTTP status codes instead.
#[derive(Error, Debug)]
pub enum CompressorError {
    /// Startup failed: temp directory unwritable, worker spawn failure, or
    /// handshake timeout. Fatal, never retried automatically.
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// No response arrived within the per-request deadline. Only the affected
    /// request fails; the worker and coordinator stay usable.
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The worker subprocess exited while requests were outstanding.
    #[error("Worker crashed: {0}")]
    WorkerCrash(String),

    /// The coordinator was shut down, rejecting this request.
    #[error("Coordinator is shut down")]
    Shutdown,

    /// Operation not permitted in the worker's current state.
    #[error("Worker state error: {0}")]
    State(String),

    /// Malformed or unexpected cross-process payload.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The worker reported a compression failure.
    #[error("Compression failed: {0}")]
    Compression(String),

    /// File IO error
    #[error("IO error: {0}")]
    Io(String),
}

/// Convenience result type for compression service operations.
pub type CompressorResult<T> = Result<T, CompressorError>;

// Helper methods for error creation
impl CompressorError {
    pub fn initialization<T: Into<String>>(msg: T) -> Self {
        Self::Initialization(msg.into())
    }

    pub fn worker_crash<T: Into<String>>(msg: T) -> Self {
        Self::WorkerCrash(msg.into())
    }

    pub fn state<T: Into<String>>(msg: T) -> Self {
        Self::State(msg.into())
    }

    pub fn serialization<T: Into<String>>(msg: T) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn compression<T: Into<String>>(msg: T) -> Self {
        Self::Compression(msg.into())
    }
}

// Convert std::io::Error to CompressorError
impl From<io::Error> for CompressorError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

// Convert serde_json::Error to CompressorError
impl From<serde_json::Error> for CompressorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
