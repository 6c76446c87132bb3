use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

/// Progress message type
#[derive(Debug, Deserialize, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Started,
    Completed,
    Error,
}

/// Fire-and-forget progress notification emitted around a compression call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Filename of the image being compressed
    pub filename: String,
    /// Lifecycle stage
    pub status: ProgressStatus,
    /// Optional additional payload (result stats, error message)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ProgressEvent {
    pub fn started(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            status: ProgressStatus::Started,
            data: None,
        }
    }

    pub fn completed(filename: &str, data: serde_json::Value) -> Self {
        Self {
            filename: filename.to_string(),
            status: ProgressStatus::Completed,
            data: Some(data),
        }
    }

    pub fn error(filename: &str, message: String) -> Self {
        Self {
            filename: filename.to_string(),
            status: ProgressStatus::Error,
            data: Some(serde_json::json!({ "error": message })),
        }
    }
}

/// Broadcast channel fan-out over an explicit subscriber list.
///
/// Subscribers are known channel handles iterated at send time; there is no
/// delivery guarantee beyond best effort, and a subscriber whose receiver is
/// gone is dropped from the list on the next broadcast.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ProgressEvent>>>>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a new listener and returns its receiving end.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Sends `event` to every live subscriber, pruning dead ones.
    pub async fn broadcast(&self, event: ProgressEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
