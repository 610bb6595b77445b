//! Resumable oplog cursor with replica failover.

use std::time::Duration;

use bson::{doc, Document};
use mongodb::options::{ClientOptions, CursorType, FindOneOptions, FindOptions};
use mongodb::{Client as MongoClient, Cursor};
use sync_core::{Backoff, BackoffConfig, RawChangeEntry, RawOp, SourcePosition, SyncError};

use crate::entry::{id_to_string, parse_oplog_document};
use crate::SourceOpts;

/// Read the newest position currently in the oplog.
///
/// Captured before the initial collection scan so tailing can start from a
/// point that predates every document the scan will emit.
pub async fn latest_oplog_position(client: &MongoClient) -> anyhow::Result<SourcePosition> {
    let oplog = client.database("local").collection::<Document>("oplog.rs");
    let options = FindOneOptions::builder().sort(doc! {"$natural": -1}).build();

    let newest = oplog
        .find_one(doc! {})
        .with_options(options)
        .await?
        .ok_or_else(|| {
            anyhow::anyhow!("oplog is empty; the source must be a replica set member")
        })?;

    Ok(newest.get_timestamp("ts")?.into())
}

enum CursorState {
    /// Initial full-collection scan, emitting one synthetic insert per
    /// existing document. `tail_from` was captured before the scan began.
    Scanning {
        cursor: Cursor<Document>,
        tail_from: SourcePosition,
    },
    /// Live tailing of `local.oplog.rs`.
    Tailing { cursor: Cursor<Document> },
}

/// Durable, resumable read position against the oplog.
///
/// With no prior checkpoint, [`OplogCursor::open`] scans the whole source
/// collection first (synthetic inserts carrying the zero position), then
/// tails the oplog from the position captured before the scan; writes that
/// raced the scan are replayed and absorbed downstream by idempotent
/// upserts. With a checkpoint, tailing resumes strictly after it.
///
/// Transient driver errors reopen the cursor against the replica set with
/// bounded exponential backoff; the driver re-runs server selection on
/// reopen, which is what carries the cursor across member failover. Once
/// the ceiling is exhausted [`OplogCursor::next`] returns a fatal error
/// and the connector takes over recovery.
pub struct OplogCursor {
    client: MongoClient,
    opts: SourceOpts,
    state: CursorState,
    /// Last position observed from the live oplog; never regresses.
    position: SourcePosition,
    backoff: Backoff,
}

impl OplogCursor {
    /// Connect and position the cursor.
    pub async fn open(
        opts: &SourceOpts,
        resume_from: Option<SourcePosition>,
        backoff_config: BackoffConfig,
    ) -> anyhow::Result<Self> {
        let mut client_options = ClientOptions::parse(&opts.source_uri).await?;
        client_options.connect_timeout = Some(Duration::from_secs(10));
        client_options.server_selection_timeout = Some(Duration::from_secs(10));
        let client = MongoClient::with_options(client_options)?;

        let (state, position) = match resume_from {
            Some(position) => {
                tracing::info!("Resuming oplog tail after checkpoint {position}");
                let cursor = open_tail(&client, &opts.namespace(), position).await?;
                (CursorState::Tailing { cursor }, position)
            }
            None => {
                let tail_from = latest_oplog_position(&client).await?;
                tracing::info!(
                    "No checkpoint; scanning {} before tailing from {tail_from}",
                    opts.namespace()
                );
                let cursor = open_scan(&client, opts).await?;
                (CursorState::Scanning { cursor, tail_from }, tail_from)
            }
        };

        Ok(Self {
            client,
            opts: opts.clone(),
            state,
            position,
            backoff: Backoff::new(backoff_config),
        })
    }

    /// The tail position captured ahead of the initial scan, when one is
    /// running. The connector persists it as the scan-start checkpoint.
    pub fn scan_start_position(&self) -> Option<SourcePosition> {
        match &self.state {
            CursorState::Scanning { tail_from, .. } => Some(*tail_from),
            CursorState::Tailing { .. } => None,
        }
    }

    /// Last position observed from the live oplog.
    pub fn current_position(&self) -> SourcePosition {
        self.position
    }

    /// Next change entry, blocking while the oplog is idle.
    ///
    /// The stream is unbounded; this only returns an error, and only once
    /// the retry ceiling is exhausted.
    pub async fn next(&mut self) -> Result<RawChangeEntry, SyncError> {
        loop {
            match &mut self.state {
                CursorState::Scanning { cursor, tail_from } => {
                    let tail_from = *tail_from;
                    match cursor.advance().await {
                        Ok(true) => {
                            let doc: Document = match cursor.current().try_into() {
                                Ok(doc) => doc,
                                Err(e) => {
                                    tracing::warn!("Skipping undecodable scan document: {e}");
                                    continue;
                                }
                            };
                            match synthetic_insert(&self.opts, doc) {
                                Ok(entry) => {
                                    self.backoff.reset();
                                    return Ok(entry);
                                }
                                Err(e) => {
                                    tracing::warn!("Skipping scan document: {e}");
                                    continue;
                                }
                            }
                        }
                        Ok(false) => {
                            tracing::info!(
                                "Initial scan of {} complete; tailing oplog from {tail_from}",
                                self.opts.namespace()
                            );
                            self.position = tail_from;
                            self.reopen_tail().await?;
                        }
                        Err(e) => {
                            tracing::warn!("Scan cursor failed, restarting scan: {e}");
                            self.delay_or_fail(&e.to_string()).await?;
                            let cursor = open_scan(&self.client, &self.opts)
                                .await
                                .map_err(|e| SyncError::transient(e.to_string()));
                            match cursor {
                                Ok(cursor) => {
                                    self.state = CursorState::Scanning { cursor, tail_from };
                                }
                                Err(e) => {
                                    tracing::warn!("Scan reopen failed: {e}");
                                }
                            }
                        }
                    }
                }
                CursorState::Tailing { cursor } => match cursor.advance().await {
                    Ok(true) => {
                        let doc: Document = match cursor.current().try_into() {
                            Ok(doc) => doc,
                            Err(e) => {
                                tracing::warn!("Skipping undecodable oplog entry: {e}");
                                continue;
                            }
                        };
                        match parse_oplog_document(&doc) {
                            Ok(Some(entry)) => {
                                self.position = entry.position;
                                self.backoff.reset();
                                return Ok(entry);
                            }
                            Ok(None) => continue,
                            Err(e) => {
                                tracing::warn!("Skipping unparseable oplog entry: {e}");
                                continue;
                            }
                        }
                    }
                    Ok(false) => {
                        // A dead tailable cursor: the capped collection
                        // rolled over our position or the server killed it.
                        tracing::warn!(
                            "Oplog cursor exhausted at {}; reopening",
                            self.position
                        );
                        self.delay_or_fail("oplog cursor exhausted").await?;
                        self.reopen_tail().await?;
                    }
                    Err(e) => {
                        tracing::warn!("Oplog tail failed at {}: {e}", self.position);
                        self.delay_or_fail(&e.to_string()).await?;
                        self.reopen_tail().await?;
                    }
                },
            }
        }
    }

    /// Release the cursor. The change log itself is durable, so closing at
    /// any point is safe; the committed checkpoint defines what re-runs.
    pub async fn close(self) {
        tracing::debug!("Oplog cursor closed at {}", self.position);
    }

    async fn reopen_tail(&mut self) -> Result<(), SyncError> {
        loop {
            match open_tail(&self.client, &self.opts.namespace(), self.position).await {
                Ok(cursor) => {
                    self.state = CursorState::Tailing { cursor };
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Failed to reopen oplog tail: {e}");
                    self.delay_or_fail(&e.to_string()).await?;
                }
            }
        }
    }

    /// Sleep per the backoff schedule, or escalate to fatal once the
    /// ceiling is reached.
    async fn delay_or_fail(&mut self, cause: &str) -> Result<(), SyncError> {
        match self.backoff.next_delay() {
            Some(delay) => {
                tracing::debug!(
                    "Retrying source in {delay:?} (attempt {})",
                    self.backoff.attempts()
                );
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Err(SyncError::fatal(format!(
                "no reachable replica set member after {} attempts: {cause}",
                self.backoff.attempts()
            ))),
        }
    }
}

async fn open_scan(client: &MongoClient, opts: &SourceOpts) -> anyhow::Result<Cursor<Document>> {
    let collection = client
        .database(&opts.source_database)
        .collection::<Document>(&opts.source_collection);
    Ok(collection.find(doc! {}).await?)
}

async fn open_tail(
    client: &MongoClient,
    namespace: &str,
    after: SourcePosition,
) -> anyhow::Result<Cursor<Document>> {
    let oplog = client.database("local").collection::<Document>("oplog.rs");
    let filter = doc! {
        "ts": {"$gt": bson::Timestamp::from(after)},
        "ns": namespace,
        "fromMigrate": {"$exists": false},
    };
    // Await-data getMores return after at most this long when the oplog is
    // idle; the driver immediately issues the next one, so waiting for new
    // entries suspends without unbounded network calls.
    let options = FindOptions::builder()
        .cursor_type(CursorType::TailableAwait)
        .max_await_time(Duration::from_secs(10))
        .build();

    Ok(oplog.find(filter).with_options(options).await?)
}

/// Entry emitted for a document found by the initial scan. Carries the
/// zero position: scan records are not oplog-derived, and the writer never
/// advances the checkpoint past a zero position, so a crash mid-scan
/// restarts the scan instead of skipping unscanned documents.
fn synthetic_insert(opts: &SourceOpts, doc: Document) -> Result<RawChangeEntry, SyncError> {
    let document_id = id_to_string(
        doc.get("_id")
            .ok_or_else(|| SyncError::data("scan document has no _id".to_string()))?,
    )?;

    Ok(RawChangeEntry {
        op: RawOp::Insert,
        namespace: opts.namespace(),
        document_id,
        document: Some(doc),
        delta: None,
        position: SourcePosition::default(),
    })
}
