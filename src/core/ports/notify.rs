use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Payload of a file-change notification. `path` is relative to the watched
/// base and uses `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChanged {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChangeEvent {
    Changed(FileChanged),
    /// The subscriber fell behind and this many notifications were dropped.
    Lagged(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("file change channel unavailable: {0}")]
    Unavailable(String),
    #[error("failed to watch {path}: {message}")]
    Watch { path: String, message: String },
}

pub struct FileChangeStream {
    rx: broadcast::Receiver<FileChanged>,
}

impl FileChangeStream {
    pub fn new(rx: broadcast::Receiver<FileChanged>) -> Self {
        Self { rx }
    }

    /// Next notification, or `None` once the channel is closed.
    pub async fn next(&mut self) -> Option<FileChangeEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(FileChangeEvent::Changed(event)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Some(FileChangeEvent::Lagged(missed))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

pub trait FileChangePort: Send + Sync {
    fn subscribe(&self) -> BoxFuture<'_, Result<FileChangeStream, NotifyError>>;
}
