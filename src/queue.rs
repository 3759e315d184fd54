//! Bounded hand-off between event producers and the single storage consumer.
//!
//! Producers (socket connections, `POST /api/v1/executions`, parser monitors)
//! call [`EventQueue::submit`]. When the queue is full a producer waits up to
//! the enqueue timeout, then the record is dropped and counted. Delivery is
//! at-most-once by construction; memory use is bounded by the capacity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::warn;

use crate::models::ExecutionRecord;

pub const QUEUE_CAPACITY: usize = 100;
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("event queue is full")]
    Full,
    #[error("event queue is closed")]
    Closed,
}

/// Producer side of the event queue. Cheap to clone; all clones share the
/// same channel and drop counter.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::Sender<ExecutionRecord>,
    timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl EventQueue {
    /// Queue with the daemon's default capacity and timeout.
    pub fn channel() -> (Self, mpsc::Receiver<ExecutionRecord>) {
        Self::bounded(QUEUE_CAPACITY, ENQUEUE_TIMEOUT)
    }

    pub fn bounded(
        capacity: usize,
        timeout: Duration,
    ) -> (Self, mpsc::Receiver<ExecutionRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Self {
            tx,
            timeout,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (queue, rx)
    }

    /// Enqueue `record`, waiting at most the configured timeout for room.
    pub async fn submit(&self, record: ExecutionRecord) -> Result<(), SubmitError> {
        match self.tx.send_timeout(record, self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(record)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    tool = %record.tool,
                    command = %record.command,
                    dropped,
                    "event queue full, dropping execution record"
                );
                Err(SubmitError::Full)
            }
            Err(SendTimeoutError::Closed(record)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    tool = %record.tool,
                    dropped,
                    "event queue closed, dropping execution record"
                );
                Err(SubmitError::Closed)
            }
        }
    }

    /// Total records dropped since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records buffered and not yet taken by the consumer.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
