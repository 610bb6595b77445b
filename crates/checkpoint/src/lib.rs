//! Checkpoint management for mongo-es-sync.
//!
//! The checkpoint is the only durable state the pipeline keeps: the last
//! change-log position whose batch was fully applied to the destination.
//! This crate keeps the storage format generic so the position type stays
//! owned by the source crate:
//!
//! - the [`Checkpoint`] trait is implemented by source-specific types
//! - [`CheckpointFile`] wraps them in a self-describing JSON envelope
//! - [`CheckpointStore`] abstracts the storage backend
//! - [`FilesystemStore`] persists checkpoints as JSON files, pruning
//!   superseded ones
//! - [`SyncManager`] ties a store to typed save/load operations

mod file;
mod filesystem;
mod manager;
mod phase;
mod store;

pub use file::CheckpointFile;
pub use filesystem::FilesystemStore;
pub use manager::SyncManager;
pub use phase::SyncPhase;
pub use store::{CheckpointID, CheckpointStore, StoredCheckpoint};

/// Trait for source-specific checkpoint types.
///
/// Implementations pair a resumable position with the wall-clock time it
/// was captured, and provide a compact string form for CLI flags and logs.
///
/// # Example
///
/// ```rust
/// use checkpoint::Checkpoint;
/// use chrono::{DateTime, Utc};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct SequenceCheckpoint {
///     sequence: i64,
///     timestamp: DateTime<Utc>,
/// }
///
/// impl Checkpoint for SequenceCheckpoint {
///     const SOURCE_TYPE: &'static str = "sequence";
///
///     fn to_cli_string(&self) -> String {
///         format!("{}:{}", self.sequence, self.timestamp.to_rfc3339())
///     }
///
///     fn from_cli_string(s: &str) -> anyhow::Result<Self> {
///         let (seq, ts) = s
///             .split_once(':')
///             .ok_or_else(|| anyhow::anyhow!("expected 'sequence:timestamp'"))?;
///         Ok(Self {
///             sequence: seq.parse()?,
///             timestamp: DateTime::parse_from_rfc3339(ts)?.with_timezone(&Utc),
///         })
///     }
/// }
/// ```
pub trait Checkpoint: serde::Serialize + for<'de> serde::Deserialize<'de> + Clone {
    /// Source type identifier embedded in stored checkpoints and validated
    /// on load, so a checkpoint directory can never be replayed against the
    /// wrong kind of source.
    const SOURCE_TYPE: &'static str;

    /// Compact string form for CLI arguments and log lines. Parseable by
    /// [`Checkpoint::from_cli_string`].
    fn to_cli_string(&self) -> String;

    /// Parse the format produced by [`Checkpoint::to_cli_string`].
    fn from_cli_string(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;
}
