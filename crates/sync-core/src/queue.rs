//! Bounded dispatch queue between translation and bulk apply.
//!
//! A thin wrapper over a bounded `tokio::sync::mpsc` channel. The producer
//! awaits on `send` when the queue is full, which propagates backpressure
//! all the way to the oplog cursor; pausing the cursor is safe because the
//! source change log is durable. The consumer drains in strict FIFO order,
//! which preserves per-document ordering because the translator never
//! reorders records derived from a single entry and entries arrive with
//! non-decreasing positions.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{ChangeRecord, SyncError};

/// Default queue capacity, sized to bound worst-case buffered memory.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Factory for the bounded record channel.
pub struct DispatchQueue;

impl DispatchQueue {
    /// Create a bounded queue with the given capacity.
    pub fn bounded(capacity: usize) -> (QueueSender, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (QueueSender { tx }, QueueReceiver { rx })
    }
}

/// Producer half; cloneable is intentionally not offered so the queue stays
/// single-producer like the translation stage that feeds it.
pub struct QueueSender {
    tx: mpsc::Sender<ChangeRecord>,
}

impl QueueSender {
    /// Enqueue one record, waiting while the queue is full.
    pub async fn send(&self, record: ChangeRecord) -> Result<(), SyncError> {
        self.tx
            .send(record)
            .await
            .map_err(|_| SyncError::fatal("dispatch queue closed: consumer is gone"))
    }
}

/// Consumer half.
pub struct QueueReceiver {
    rx: mpsc::Receiver<ChangeRecord>,
}

impl QueueReceiver {
    /// Receive the next record; `None` once the producer hung up and the
    /// queue drained.
    pub async fn recv(&mut self) -> Option<ChangeRecord> {
        self.rx.recv().await
    }

    /// Drain up to `max` records, waiting at most `max_wait` after the
    /// first one arrives. Returns an empty vec only when the queue closed.
    ///
    /// This is the writer's latency-bounded batching primitive: the first
    /// record is awaited indefinitely, then the batch fills until either
    /// the count bound or the flush deadline is hit.
    pub async fn recv_batch(&mut self, max: usize, max_wait: Duration) -> Vec<ChangeRecord> {
        let mut batch = Vec::with_capacity(max.min(64));

        match self.rx.recv().await {
            Some(record) => batch.push(record),
            None => return batch,
        }

        let deadline = Instant::now() + max_wait;
        while batch.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(record)) => batch.push(record),
                Ok(None) => break,
                Err(_) => break,
            }
        }

        batch
    }

    /// Close the receiving side; pending sends fail afterwards.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
