//! Bounded output queue.
//!
//! Records are posted as opaque byte buffers with a post-or-timeout contract;
//! an empty message is the end-of-data sentinel. Backpressure comes from the
//! bounded channel: a full queue turns into `PostError::Timeout`, which the
//! beam workers retry while the reader stays active.

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Bound applied to each post before it reports a timeout.
pub const SYS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostError {
    #[error("post timed out")]
    Timeout,

    #[error("queue closed")]
    Closed,
}

/// Producer half of the record stream.
#[derive(Clone)]
pub struct OutputQueue {
    tx: mpsc::Sender<Bytes>,
}

impl OutputQueue {
    /// Create a queue bounded at `capacity` records.
    pub fn channel(capacity: usize) -> (OutputQueue, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (OutputQueue { tx }, rx)
    }

    /// Post one record, waiting at most `timeout`. Returns the posted length.
    pub async fn post(&self, buf: Bytes, timeout: Duration) -> Result<usize, PostError> {
        let len = buf.len();
        match self.tx.send_timeout(buf, timeout).await {
            Ok(()) => Ok(len),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(PostError::Timeout),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(PostError::Closed),
        }
    }

    /// Post the end-of-data sentinel (an empty message).
    pub async fn post_terminator(&self) -> Result<usize, PostError> {
        self.post(Bytes::new(), SYS_TIMEOUT).await
    }
}

/// True when a received message is the end-of-data sentinel.
pub fn is_terminator(msg: &Bytes) -> bool {
    msg.is_empty()
}
