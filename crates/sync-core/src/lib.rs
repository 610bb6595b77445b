//! Core types for the mongo-es-sync pipeline.
//!
//! This crate defines the normalized mutation stream flowing between the
//! oplog source and the Elasticsearch sink:
//!
//! - [`RawChangeEntry`] - one parsed source change-log record
//! - [`ChangeRecord`] - one normalized destination mutation
//! - [`SourcePosition`] - the totally-ordered change-log offset
//! - [`DispatchQueue`] - the bounded hand-off between producer and consumer
//! - [`SyncError`] - the transient/data/fatal error taxonomy
//!
//! Source and sink crates depend on this crate and nothing else in the
//! workspace, so the data model stays free of database client types apart
//! from BSON documents, which carry payloads end-to-end.

mod backoff;
mod error;
mod position;
pub mod queue;
mod record;

pub use backoff::{Backoff, BackoffConfig};
pub use error::SyncError;
pub use position::SourcePosition;
pub use queue::{DispatchQueue, QueueReceiver, QueueSender};
pub use record::{ChangeRecord, EntityKind, Operation, RawChangeEntry, RawOp, UpdateDelta};
