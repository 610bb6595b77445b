//! Sink-side trait seams.

use async_trait::async_trait;
use sync_core::SourcePosition;

use crate::bulk::{BulkItemStatus, BulkOp};

/// Destination index accepting bulk operations.
///
/// Implemented by [`crate::EsClient`] against the Elasticsearch REST API;
/// test writers substitute in-memory implementations so the batching,
/// retry and checkpoint logic runs without a live cluster.
#[async_trait]
pub trait SearchSink: Send + Sync {
    /// Create the destination index with parent/child mapping if it does
    /// not exist yet. Idempotent.
    async fn ensure_index(&self) -> anyhow::Result<()>;

    /// Apply operations in order, returning one status per operation.
    ///
    /// A transport-level failure (connection refused, timeout, non-2xx
    /// envelope) is an `Err`; per-operation rejections come back as item
    /// statuses so the caller can retry just the failed subset.
    async fn bulk(&self, ops: &[BulkOp]) -> anyhow::Result<Vec<BulkItemStatus>>;
}

/// Durable checkpoint commit, owned by the index writer's commit path.
///
/// The connector wires this to checkpoint storage; the writer calls it
/// exactly once per fully-applied batch, after which the position is the
/// restart point.
#[async_trait]
pub trait PositionCommitter: Send + Sync {
    async fn commit(&self, position: SourcePosition) -> anyhow::Result<()>;
}
