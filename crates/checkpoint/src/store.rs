//! Storage backend trait for checkpoint persistence.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a checkpoint slot within a store: one per (source, phase).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointID {
    /// Source type (e.g. "mongodb-oplog").
    pub source_type: String,
    /// Phase string ("full_scan_start" or "committed").
    pub phase: String,
}

/// Envelope persisted by a store backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCheckpoint {
    /// JSON-serialized source-specific checkpoint.
    pub checkpoint_data: String,
    /// Source type, for validation on load.
    pub source_type: String,
    /// Phase string, for validation on load.
    pub phase: String,
    /// When the checkpoint was persisted.
    pub created_at: DateTime<Utc>,
}

/// Abstracts where checkpoints live.
///
/// The pipeline writes through this trait from the index writer's commit
/// path and reads through it during connector initialization. Only the
/// filesystem backend ships today; the trait keeps the commit path
/// independent of that choice.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, superseding any earlier one for the same ID.
    async fn store_checkpoint(&self, id: &CheckpointID, checkpoint_data: String) -> Result<()>;

    /// Load the most recent checkpoint for the ID, or `None` if the slot
    /// has never been written.
    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>>;
}
