//! Connector orchestration and state machine.
//!
//! Wires the pipeline together - oplog cursor and translator on the
//! producer side, index writer on the consumer side, joined by the bounded
//! dispatch queue - and supervises it through an explicit state machine:
//!
//! ```text
//! INITIALIZING -> RUNNING -> RECOVERING -> STOPPED
//!       |            |           |
//!       |            +-----------+  (fatal source/sink error)
//!       +--------------------------> STOPPED (external stop)
//! ```
//!
//! RECOVERING re-runs initialization from the last committed checkpoint
//! after a pause; repeated consecutive failures past the configured
//! ceiling stop the connector for good. Translator state (known child ids,
//! sequence counters) lives in the supervisor and survives recovery
//! cycles, so a parent deleted after a recovery still takes its
//! previously-observed children with it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use checkpoint::{FilesystemStore, SyncManager, SyncPhase};
use elasticsearch_sink::{EsClient, EsOpts, IndexWriter, PositionCommitter, SearchSink, WriterConfig};
use mongo_es_sync_oplog_source::{
    ChangeTranslator, MongoParentFetcher, OplogCheckpoint, OplogCursor, SourceOpts,
};
use sync_core::{BackoffConfig, DispatchQueue, SourcePosition, SyncError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A pipeline that keeps failing is considered healthy again once it has
/// run this long, resetting the consecutive-failure count.
const HEALTHY_RUN_THRESHOLD: Duration = Duration::from_secs(60);

/// Everything the connector needs to run one pipeline.
#[derive(Clone)]
pub struct ConnectorConfig {
    pub source: SourceOpts,
    pub es: EsOpts,
    /// Dispatch queue capacity between translation and bulk apply.
    pub queue_capacity: usize,
    pub writer: WriterConfig,
    /// Backoff for cursor reopen attempts inside a running pipeline.
    pub source_backoff: BackoffConfig,
    pub checkpoint_dir: String,
    /// Consecutive pipeline failures tolerated before STOPPED.
    pub recovery_ceiling: u32,
    /// Pause between recovery attempts.
    pub recovery_delay: Duration,
}

/// Connector lifecycle states, visible to the provisioning layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Initializing,
    Running,
    Recovering,
    Stopped,
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectorState::Initializing => "initializing",
            ConnectorState::Running => "running",
            ConnectorState::Recovering => "recovering",
            ConnectorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone)]
pub struct ConnectorStatus {
    pub state: ConnectorState,
    /// The failure that put the connector into RECOVERING or STOPPED.
    pub last_error: Option<String>,
}

impl ConnectorStatus {
    fn new(state: ConnectorState) -> Self {
        Self {
            state,
            last_error: None,
        }
    }

    fn with_error(state: ConnectorState, error: &SyncError) -> Self {
        Self {
            state,
            last_error: Some(error.to_string()),
        }
    }
}

/// Handle to a running connector.
pub struct Connector {
    status: watch::Receiver<ConnectorStatus>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Connector {
    /// Spawn the supervisor and return immediately; initialization runs in
    /// the background and failures surface through [`Connector::status`].
    pub async fn start(config: ConnectorConfig) -> anyhow::Result<Self> {
        let (status_tx, status_rx) = watch::channel(ConnectorStatus::new(ConnectorState::Initializing));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(supervise(config, status_tx, shutdown.clone()));

        Ok(Self {
            status: status_rx,
            shutdown,
            handle,
        })
    }

    /// Current lifecycle snapshot.
    pub fn status(&self) -> ConnectorStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every status change; used to wait for
    /// STOPPED without holding the connector handle.
    pub fn status_receiver(&self) -> watch::Receiver<ConnectorStatus> {
        self.status.clone()
    }

    /// Request a stop and wait for the pipeline to drain its in-flight
    /// batch and release resources.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        self.handle.await.context("Connector task panicked")?;
        Ok(())
    }
}

/// Outer supervision loop: run the pipeline, classify its exit, recover or
/// stop.
async fn supervise(
    config: ConnectorConfig,
    status_tx: watch::Sender<ConnectorStatus>,
    shutdown: CancellationToken,
) {
    // Owned here so known-child tracking and sequence counters survive
    // RECOVERING cycles within the process.
    let mut translator = match MongoParentFetcher::connect(&config.source).await {
        Ok(fetcher) => ChangeTranslator::new(config.source.child_field.clone(), fetcher),
        Err(e) => {
            tracing::error!("Failed to construct parent fetcher: {e:#}");
            let error = SyncError::fatal(e.to_string());
            let _ = status_tx.send(ConnectorStatus::with_error(ConnectorState::Stopped, &error));
            return;
        }
    };

    let mut consecutive_failures = 0u32;

    loop {
        let _ = status_tx.send(ConnectorStatus::new(ConnectorState::Initializing));
        let started = Instant::now();

        match run_pipeline(&config, &mut translator, &status_tx, &shutdown).await {
            Ok(()) => {
                tracing::info!("Connector stopped");
                let _ = status_tx.send(ConnectorStatus::new(ConnectorState::Stopped));
                return;
            }
            Err(error) => {
                if started.elapsed() >= HEALTHY_RUN_THRESHOLD {
                    consecutive_failures = 0;
                }
                consecutive_failures += 1;
                tracing::error!(
                    "Pipeline failed ({consecutive_failures}/{}): {error}",
                    config.recovery_ceiling
                );

                if shutdown.is_cancelled() || consecutive_failures > config.recovery_ceiling {
                    let _ = status_tx
                        .send(ConnectorStatus::with_error(ConnectorState::Stopped, &error));
                    return;
                }

                let _ = status_tx
                    .send(ConnectorStatus::with_error(ConnectorState::Recovering, &error));
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        let _ = status_tx
                            .send(ConnectorStatus::with_error(ConnectorState::Stopped, &error));
                        return;
                    }
                    _ = tokio::time::sleep(config.recovery_delay) => {}
                }
            }
        }
    }
}

/// Persists committed positions through the checkpoint manager. Owned by
/// the index writer's commit path; nothing else writes checkpoints while
/// the pipeline runs.
struct CheckpointCommitter {
    manager: Arc<SyncManager<FilesystemStore>>,
}

#[async_trait]
impl PositionCommitter for CheckpointCommitter {
    async fn commit(&self, position: SourcePosition) -> anyhow::Result<()> {
        self.manager
            .emit_checkpoint(&OplogCheckpoint::new(position), SyncPhase::Committed)
            .await
    }
}

/// One pipeline incarnation: initialize from the checkpoint, then pump
/// entries until stop or failure. `Ok(())` means a clean, requested stop.
async fn run_pipeline<F>(
    config: &ConnectorConfig,
    translator: &mut ChangeTranslator<F>,
    status_tx: &watch::Sender<ConnectorStatus>,
    shutdown: &CancellationToken,
) -> Result<(), SyncError>
where
    F: mongo_es_sync_oplog_source::ParentFetcher,
{
    let manager = Arc::new(SyncManager::new(FilesystemStore::new(&config.checkpoint_dir)));

    let resume_from = manager
        .read_checkpoint::<OplogCheckpoint>(SyncPhase::Committed)
        .await
        .map_err(|e| SyncError::fatal(format!("failed to load checkpoint: {e}")))?
        .map(|c| c.position);

    let mut cursor = OplogCursor::open(&config.source, resume_from, config.source_backoff.clone())
        .await
        .map_err(|e| SyncError::transient(format!("failed to open oplog cursor: {e}")))?;

    if let Some(scan_start) = cursor.scan_start_position() {
        manager
            .emit_checkpoint(&OplogCheckpoint::new(scan_start), SyncPhase::FullScanStart)
            .await
            .map_err(|e| SyncError::fatal(format!("failed to emit scan checkpoint: {e}")))?;
    }

    let client = EsClient::new(config.es.clone())
        .map_err(|e| SyncError::fatal(e.to_string()))?;
    client
        .ensure_index()
        .await
        .map_err(|e| SyncError::transient(format!("failed to prepare index: {e}")))?;

    let (queue_tx, queue_rx) = DispatchQueue::bounded(config.queue_capacity);
    let writer = IndexWriter::new(
        client,
        CheckpointCommitter {
            manager: Arc::clone(&manager),
        },
        config.es.clone(),
        config.writer.clone(),
        resume_from.unwrap_or_default(),
    );

    let writer_cancel = shutdown.child_token();
    let mut writer_handle = tokio::spawn(writer.run(queue_rx, writer_cancel));

    let _ = status_tx.send(ConnectorStatus::new(ConnectorState::Running));
    tracing::info!(
        "Pipeline running: {} -> {}/{}",
        config.source.namespace(),
        config.es.es_endpoint,
        config.es.es_index
    );

    // Set when the writer exits while the producer loop is still going, so
    // the handle is never awaited twice.
    let mut early_writer_result: Option<Result<(), SyncError>> = None;

    let producer_result: Result<(), SyncError> = 'producer: loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!("Stop requested; draining pipeline");
                break 'producer Ok(());
            }
            exited = &mut writer_handle => {
                early_writer_result = Some(flatten_join(exited));
                break 'producer Ok(());
            }
            entry = cursor.next() => {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => break 'producer Err(e),
                };
                match translator.translate(&entry).await {
                    Ok(records) => {
                        for record in records {
                            if let Err(e) = queue_tx.send(record).await {
                                break 'producer Err(e);
                            }
                        }
                    }
                    Err(e) if e.is_data() => {
                        tracing::warn!("Skipping malformed entry at {}: {e}", entry.position);
                    }
                    Err(e) => break 'producer Err(e),
                }
            }
        }
    };

    // Close the queue so the writer drains what was enqueued and exits.
    drop(queue_tx);
    cursor.close().await;

    let writer_result = match early_writer_result {
        Some(result) => result,
        None => flatten_join(writer_handle.await),
    };

    producer_result.and(writer_result)
}

fn flatten_join(
    joined: Result<Result<(), SyncError>, tokio::task::JoinError>,
) -> Result<(), SyncError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(SyncError::fatal(format!("index writer panicked: {e}"))),
    }
}
