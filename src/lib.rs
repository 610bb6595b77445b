//! mongo-es-sync library
//!
//! A change-data-capture connector that continuously mirrors a MongoDB
//! collection into an Elasticsearch index. Documents with an embedded
//! child array are decomposed into one parent document plus independently
//! searchable child documents that stay queryable by parent id through
//! Elasticsearch join-field routing.
//!
//! # Features
//!
//! - Initial full-collection scan followed by live oplog tailing
//! - Durable, resumable read position (filesystem checkpoints)
//! - At-least-once delivery with idempotent upserts and per-document
//!   ordering
//! - Replica-set failover and destination outages handled with bounded
//!   backoff and an explicit RECOVERING state
//!
//! # Workspace crates
//!
//! - `sync-core` - the normalized mutation stream and dispatch queue
//! - `checkpoint` - durable position storage
//! - `mongo-es-sync-oplog-source` - oplog cursor and change translator
//! - `elasticsearch-sink` - bulk client and index writer
//!
//! # CLI Usage
//!
//! ```bash
//! # Continuous sync (full scan on first start, tailing afterwards)
//! mongo-es-sync run \
//!   --source-uri mongodb://localhost:27017 \
//!   --source-database blog --source-collection posts \
//!   --child-field tweets \
//!   --es-endpoint http://localhost:9200 --es-index posts
//!
//! # Inspect the persisted checkpoint
//! mongo-es-sync checkpoint show --checkpoint-dir .mongo-es-sync-checkpoints
//! ```

use std::time::Duration;

use clap::Parser;
use sync_core::BackoffConfig;

pub mod connector;

pub use connector::{Connector, ConnectorConfig, ConnectorState, ConnectorStatus};

/// Source database options.
#[derive(Parser, Clone, Debug)]
pub struct SourceArgs {
    /// MongoDB connection string (must be a replica set member)
    #[arg(long, default_value = "mongodb://localhost:27017", env = "MONGO_URI")]
    pub source_uri: String,

    /// Source database name
    #[arg(long)]
    pub source_database: String,

    /// Source collection to mirror
    #[arg(long)]
    pub source_collection: String,

    /// Document field holding the embedded child array
    #[arg(long, default_value = "tweets")]
    pub child_field: String,
}

impl From<&SourceArgs> for mongo_es_sync_oplog_source::SourceOpts {
    fn from(args: &SourceArgs) -> Self {
        Self {
            source_uri: args.source_uri.clone(),
            source_database: args.source_database.clone(),
            source_collection: args.source_collection.clone(),
            child_field: args.child_field.clone(),
        }
    }
}

/// Destination index options.
#[derive(Parser, Clone, Debug)]
pub struct EsArgs {
    /// Elasticsearch endpoint URL
    #[arg(long, default_value = "http://localhost:9200", env = "ES_ENDPOINT")]
    pub es_endpoint: String,

    /// Elasticsearch username for basic auth
    #[arg(long, env = "ES_USERNAME")]
    pub es_username: Option<String>,

    /// Elasticsearch password for basic auth
    #[arg(long, env = "ES_PASSWORD")]
    pub es_password: Option<String>,

    /// Destination index name
    #[arg(long)]
    pub es_index: String,

    /// Join field name injected into every document
    #[arg(long, default_value = "doc_relation")]
    pub join_field: String,

    /// Join relation name for parent documents
    #[arg(long, default_value = "document")]
    pub parent_relation: String,

    /// Join relation name for child documents
    #[arg(long, default_value = "child")]
    pub child_relation: String,
}

impl From<&EsArgs> for elasticsearch_sink::EsOpts {
    fn from(args: &EsArgs) -> Self {
        Self {
            es_endpoint: args.es_endpoint.clone(),
            es_username: args.es_username.clone(),
            es_password: args.es_password.clone(),
            es_index: args.es_index.clone(),
            join_field: args.join_field.clone(),
            parent_relation: args.parent_relation.clone(),
            child_relation: args.child_relation.clone(),
        }
    }
}

/// Pipeline sizing, batching and retry options.
#[derive(Parser, Clone, Debug)]
pub struct PipelineArgs {
    /// Dispatch queue capacity (records buffered between translation and
    /// bulk apply)
    #[arg(long, default_value = "4096")]
    pub queue_capacity: usize,

    /// Maximum operations per bulk request
    #[arg(long, default_value = "500")]
    pub bulk_max_actions: usize,

    /// Maximum payload bytes per bulk request
    #[arg(long, default_value = "5242880")]
    pub bulk_max_bytes: usize,

    /// Maximum milliseconds a record waits before its batch flushes
    #[arg(long, default_value = "1000")]
    pub bulk_flush_interval_ms: u64,

    /// Directory for checkpoint files
    #[arg(long, default_value = ".mongo-es-sync-checkpoints")]
    pub checkpoint_dir: String,

    /// Retries per failed operation before the failure is fatal
    #[arg(long, default_value = "8")]
    pub max_retries: u32,

    /// Base retry delay in milliseconds
    #[arg(long, default_value = "500")]
    pub retry_base_delay_ms: u64,

    /// Retry delay ceiling in milliseconds
    #[arg(long, default_value = "30000")]
    pub retry_max_delay_ms: u64,

    /// Consecutive pipeline failures tolerated before the connector stops
    #[arg(long, default_value = "10")]
    pub recovery_ceiling: u32,

    /// Pause between recovery attempts in milliseconds
    #[arg(long, default_value = "5000")]
    pub recovery_delay_ms: u64,
}

impl PipelineArgs {
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            max_retries: self.max_retries,
        }
    }

    pub fn writer_config(&self) -> elasticsearch_sink::WriterConfig {
        elasticsearch_sink::WriterConfig {
            max_actions: self.bulk_max_actions,
            max_bytes: self.bulk_max_bytes,
            flush_interval: Duration::from_millis(self.bulk_flush_interval_ms),
            backoff: self.backoff_config(),
        }
    }
}

impl ConnectorConfig {
    /// Assemble a connector config from parsed CLI argument groups.
    pub fn from_args(source: &SourceArgs, es: &EsArgs, pipeline: &PipelineArgs) -> Self {
        Self {
            source: source.into(),
            es: es.into(),
            queue_capacity: pipeline.queue_capacity,
            writer: pipeline.writer_config(),
            source_backoff: pipeline.backoff_config(),
            checkpoint_dir: pipeline.checkpoint_dir.clone(),
            recovery_ceiling: pipeline.recovery_ceiling,
            recovery_delay: Duration::from_millis(pipeline.recovery_delay_ms),
        }
    }
}
