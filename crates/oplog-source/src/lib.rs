//! MongoDB oplog source for mongo-es-sync.
//!
//! Reads the replica set's oplog (`local.oplog.rs`) as the durable change
//! log, normalizes entries, and expands embedded child arrays into
//! independent child records. Three pieces:
//!
//! - [`OplogCursor`] - resumable tailing with initial full-collection scan
//!   and reconnect-with-backoff failover
//! - [`ChangeTranslator`] - raw entries to [`sync_core::ChangeRecord`]s,
//!   including the per-parent known-child-id tracking
//! - [`OplogCheckpoint`] - the persisted resume position

mod cursor;
mod entry;
mod resume;
mod translate;

pub use resume::OplogCheckpoint;
pub use cursor::{latest_oplog_position, OplogCursor};
pub use entry::{id_to_string, parse_oplog_document};
pub use translate::{ChangeTranslator, MongoParentFetcher, ParentFetcher};

/// Source connection options (library type, no CLI coupling).
#[derive(Clone, Debug)]
pub struct SourceOpts {
    /// MongoDB connection string; must point at a replica set so the oplog
    /// exists.
    pub source_uri: String,
    /// Database holding the mirrored collection.
    pub source_database: String,
    /// Collection to mirror.
    pub source_collection: String,
    /// Field holding the embedded child array (e.g. "tweets").
    pub child_field: String,
}

impl SourceOpts {
    /// Oplog namespace string for the mirrored collection.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.source_database, self.source_collection)
    }
}
