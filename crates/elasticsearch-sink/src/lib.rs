//! Elasticsearch sink for mongo-es-sync.
//!
//! Applies the normalized mutation stream to an Elasticsearch index with
//! batched `_bulk` requests, parent/child join-field routing, and
//! at-least-once checkpointing:
//!
//! - [`SearchSink`] - the destination trait; implemented by [`EsClient`]
//! - [`IndexWriter`] - batching, stale-sequence filtering, subset retry,
//!   checkpoint commit
//! - [`bulk`] - bulk operation building and response classification

pub mod bulk;
mod client;
mod traits;
mod writer;

pub use client::EsClient;
pub use traits::{PositionCommitter, SearchSink};
pub use writer::{ApplyOutcome, IndexWriter, WriterConfig};

/// Destination connection and mapping options (library type, no CLI
/// coupling).
#[derive(Clone, Debug)]
pub struct EsOpts {
    /// Elasticsearch base URL.
    pub es_endpoint: String,
    /// Optional basic-auth credentials.
    pub es_username: Option<String>,
    pub es_password: Option<String>,
    /// Destination index name.
    pub es_index: String,
    /// Name of the join field injected into every document.
    pub join_field: String,
    /// Relation name for parent documents.
    pub parent_relation: String,
    /// Relation name for child documents.
    pub child_relation: String,
}

impl EsOpts {
    /// Options with the default join-field naming for an index.
    pub fn new(endpoint: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            es_endpoint: endpoint.into(),
            es_username: None,
            es_password: None,
            es_index: index.into(),
            join_field: "doc_relation".to_string(),
            parent_relation: "document".to_string(),
            child_relation: "child".to_string(),
        }
    }
}
