//! Task dispatcher: the queue seam between request intake and the workers
//!
//! The queue transport is consumed as a dependency, not redesigned; delivery
//! is at-least-once, so consumers rely on the ledger's unique request id and
//! exclusive claim to tolerate duplicates. The in-process implementation fans
//! work out over a tokio channel.

use crate::error::{RelayError, RelayResult};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Work fanned out to worker tasks. Confirmation polling and bid refresh
/// run on their own timers and never pass through the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    /// A freshly validated transfer is ready for submission.
    SubmitTransfer([u8; 32]),
}

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn enqueue(&self, item: WorkItem) -> RelayResult<()>;
}

/// In-process dispatcher over a bounded tokio channel.
pub struct QueueDispatcher {
    tx: mpsc::Sender<WorkItem>,
}

impl QueueDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskDispatcher for QueueDispatcher {
    async fn enqueue(&self, item: WorkItem) -> RelayResult<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| RelayError::Internal("Task queue closed".to_string()))
    }
}
