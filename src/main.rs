//! Command-line interface for mongo-es-sync
//!
//! # Usage Examples
//!
//! ```bash
//! # Continuous sync: full collection scan on first start, then live
//! # oplog tailing with durable checkpoints
//! mongo-es-sync run \
//!   --source-uri mongodb://localhost:27017 \
//!   --source-database blog \
//!   --source-collection posts \
//!   --child-field tweets \
//!   --es-endpoint http://localhost:9200 \
//!   --es-index posts
//!
//! # Show the latest persisted checkpoints
//! mongo-es-sync checkpoint show --checkpoint-dir .mongo-es-sync-checkpoints
//! ```
//!
//! Checkpoint format: `time.ordinal:rfc3339-timestamp`, where
//! `time.ordinal` is the oplog position of the last fully-applied batch.

use anyhow::Context;
use checkpoint::{Checkpoint, FilesystemStore, SyncManager, SyncPhase};
use clap::{Parser, Subcommand};
use mongo_es_sync::{Connector, ConnectorConfig, ConnectorState, EsArgs, PipelineArgs, SourceArgs};
use mongo_es_sync_oplog_source::OplogCheckpoint;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "mongo-es-sync")]
#[command(about = "Continuously replicate a MongoDB collection to Elasticsearch")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the connector until interrupted or stopped by a fatal error
    Run {
        /// Source database options
        #[command(flatten)]
        source: SourceArgs,

        /// Destination index options
        #[command(flatten)]
        es: EsArgs,

        /// Pipeline sizing and retry options
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Checkpoint utilities
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// Print the latest persisted checkpoints
    Show {
        /// Directory holding checkpoint files
        #[arg(long, default_value = ".mongo-es-sync-checkpoints")]
        checkpoint_dir: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            source,
            es,
            pipeline,
        } => run_connector(ConnectorConfig::from_args(&source, &es, &pipeline)).await,
        Commands::Checkpoint {
            command: CheckpointCommands::Show { checkpoint_dir },
        } => show_checkpoints(&checkpoint_dir).await,
    }
}

async fn run_connector(config: ConnectorConfig) -> anyhow::Result<()> {
    let connector = Connector::start(config)
        .await
        .context("Failed to start connector")?;
    let mut status_rx = connector.status_receiver();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received; stopping connector");
            connector.stop().await?;
            Ok(())
        }
        status = wait_until_stopped(&mut status_rx) => {
            match status.last_error {
                Some(error) => Err(anyhow::anyhow!("Connector stopped after failure: {error}")),
                None => Ok(()),
            }
        }
    }
}

/// Resolve once the connector reaches STOPPED on its own.
async fn wait_until_stopped(
    status_rx: &mut watch::Receiver<mongo_es_sync::ConnectorStatus>,
) -> mongo_es_sync::ConnectorStatus {
    loop {
        let status = status_rx.borrow().clone();
        if status.state == ConnectorState::Stopped {
            return status;
        }
        if status_rx.changed().await.is_err() {
            return status;
        }
    }
}

async fn show_checkpoints(checkpoint_dir: &str) -> anyhow::Result<()> {
    let manager = SyncManager::new(FilesystemStore::new(checkpoint_dir));

    let committed: Option<OplogCheckpoint> =
        manager.read_checkpoint(SyncPhase::Committed).await?;
    let scan_start: Option<OplogCheckpoint> =
        manager.read_checkpoint(SyncPhase::FullScanStart).await?;

    match &committed {
        Some(checkpoint) => println!("committed:       {}", checkpoint.to_cli_string()),
        None => println!("committed:       (none)"),
    }
    match &scan_start {
        Some(checkpoint) => println!("full_scan_start: {}", checkpoint.to_cli_string()),
        None => println!("full_scan_start: (none)"),
    }

    if committed.is_none() && scan_start.is_none() {
        anyhow::bail!("No checkpoints found in '{checkpoint_dir}'");
    }
    Ok(())
}
