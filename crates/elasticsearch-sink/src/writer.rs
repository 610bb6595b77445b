//! Batched, idempotent apply of the mutation stream.

use std::collections::HashMap;
use std::time::Duration;

use sync_core::queue::QueueReceiver;
use sync_core::{Backoff, BackoffConfig, ChangeRecord, EntityKind, SourcePosition, SyncError};
use tokio_util::sync::CancellationToken;

use crate::bulk::{classify, op_size, record_to_op, BulkOp, ItemOutcome};
use crate::{EsOpts, PositionCommitter, SearchSink};

/// Bulk batching thresholds. All three are configuration, not architecture;
/// whichever bound triggers first flushes the batch.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum operations per bulk request.
    pub max_actions: usize,
    /// Maximum request payload bytes per bulk request.
    pub max_bytes: usize,
    /// Maximum time a drained record waits before its batch flushes.
    pub flush_interval: Duration,
    /// Retry policy for rejected operations and transport failures.
    pub backoff: BackoffConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_actions: 500,
            max_bytes: 5 * 1024 * 1024,
            flush_interval: Duration::from_millis(1000),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Result of applying one drained batch.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Records applied to the destination.
    pub applied: usize,
    /// Records skipped by the stale-sequence check.
    pub skipped_stale: usize,
    /// Records permanently rejected and dropped.
    pub dropped: usize,
    /// Checkpoint position committed for this batch, if it advanced.
    pub committed: Option<SourcePosition>,
}

/// Applies change records to the destination in bulk batches.
///
/// Guarantees, in combination with FIFO delivery from the queue:
/// - records for one document apply in enqueue order; stale re-deliveries
///   (lower sequence than already applied) are skipped
/// - the checkpoint advances only past batches in which every record was
///   applied or permanently dropped, and is persisted before the next
///   batch starts, so a crash re-delivers at most one batch
/// - rejected operations retry as a subset with bounded backoff; once the
///   ceiling is exhausted the error is fatal and the checkpoint holds
pub struct IndexWriter<S: SearchSink, P: PositionCommitter> {
    sink: S,
    committer: P,
    opts: EsOpts,
    config: WriterConfig,
    /// Highest applied sequence per destination document. Entries are
    /// evicted on delete, mirroring the translator's counter eviction, so
    /// a re-created document starts over on both sides.
    applied_sequences: HashMap<String, u64>,
    committed: SourcePosition,
}

impl<S: SearchSink, P: PositionCommitter> IndexWriter<S, P> {
    pub fn new(
        sink: S,
        committer: P,
        opts: EsOpts,
        config: WriterConfig,
        resume_from: SourcePosition,
    ) -> Self {
        Self {
            sink,
            committer,
            opts,
            config,
            applied_sequences: HashMap::new(),
            committed: resume_from,
        }
    }

    /// Last committed checkpoint position.
    pub fn committed_position(&self) -> SourcePosition {
        self.committed
    }

    /// Drain the queue until it closes or the token cancels.
    ///
    /// Cancellation is observed between batches only: an in-flight batch
    /// always runs to completion so its checkpoint is recorded and no
    /// half-applied batch is abandoned without one.
    pub async fn run(
        mut self,
        mut queue: QueueReceiver,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Index writer stopping at {}", self.committed);
                    return Ok(());
                }
                batch = queue.recv_batch(self.config.max_actions, self.config.flush_interval) => batch,
            };

            if batch.is_empty() {
                tracing::info!("Dispatch queue closed; index writer exiting");
                return Ok(());
            }

            let outcome = self.apply(batch).await?;
            tracing::debug!(
                "Batch applied: {} applied, {} stale, {} dropped, committed {:?}",
                outcome.applied,
                outcome.skipped_stale,
                outcome.dropped,
                outcome.committed
            );
        }
    }

    /// Apply one batch of drained records.
    pub async fn apply(&mut self, batch: Vec<ChangeRecord>) -> Result<ApplyOutcome, SyncError> {
        let mut outcome = ApplyOutcome::default();
        if batch.is_empty() {
            return Ok(outcome);
        }

        let max_position = batch
            .iter()
            .map(|r| r.position)
            .max()
            .unwrap_or_default();

        let mut pairs = Vec::with_capacity(batch.len());
        for record in batch {
            if self.is_stale(&record) {
                tracing::debug!(
                    "Skipping stale delivery of {} (sequence {})",
                    record.document_id,
                    record.sequence
                );
                outcome.skipped_stale += 1;
                continue;
            }
            match record_to_op(&record, &self.opts) {
                Ok(op) => pairs.push((record, op)),
                Err(e) => {
                    tracing::warn!("Dropping untranslatable record: {e}");
                    outcome.dropped += 1;
                }
            }
        }

        for chunk in chunk_by_size(pairs, self.config.max_actions, self.config.max_bytes) {
            let (applied, dropped) = self.apply_chunk(chunk).await?;
            outcome.applied += applied;
            outcome.dropped += dropped;
        }

        // Scan-derived records carry the zero position; the checkpoint
        // never advances past them, so a crash mid-scan re-scans instead
        // of skipping unscanned documents.
        if !max_position.is_zero() && max_position > self.committed {
            self.committer
                .commit(max_position)
                .await
                .map_err(|e| SyncError::fatal(format!("checkpoint commit failed: {e}")))?;
            self.committed = max_position;
            outcome.committed = Some(max_position);
        }

        Ok(outcome)
    }

    /// Apply one bulk chunk, retrying the rejected subset until it drains
    /// or the backoff ceiling turns the failure fatal.
    async fn apply_chunk(
        &mut self,
        mut pending: Vec<(ChangeRecord, BulkOp)>,
    ) -> Result<(usize, usize), SyncError> {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut applied = 0;
        let mut dropped = 0;

        while !pending.is_empty() {
            let ops: Vec<BulkOp> = pending.iter().map(|(_, op)| op.clone()).collect();

            let statuses = match self.sink.bulk(&ops).await {
                Ok(statuses) => statuses,
                Err(e) => {
                    match backoff.next_delay() {
                        Some(delay) => {
                            tracing::warn!("Bulk request failed, retrying in {delay:?}: {e}");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        None => {
                            return Err(SyncError::fatal(format!(
                                "destination unreachable after {} attempts: {e}",
                                backoff.attempts()
                            )))
                        }
                    }
                }
            };

            let mut retry = Vec::new();
            for ((record, op), status) in pending.into_iter().zip(statuses) {
                match classify(&op, &status) {
                    ItemOutcome::Success => {
                        self.mark_applied(&record);
                        applied += 1;
                    }
                    ItemOutcome::Retry => retry.push((record, op)),
                    ItemOutcome::Drop => {
                        tracing::error!(
                            "Destination permanently rejected {} (status {}): {}",
                            record.document_id,
                            status.status,
                            status.error.as_deref().unwrap_or("no error detail")
                        );
                        dropped += 1;
                    }
                }
            }

            if retry.is_empty() {
                break;
            }

            match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        "{} operations rejected, retrying in {delay:?}",
                        retry.len()
                    );
                    tokio::time::sleep(delay).await;
                    pending = retry;
                }
                None => {
                    return Err(SyncError::fatal(format!(
                        "destination rejected {} operations after {} retries; checkpoint held at {}",
                        retry.len(),
                        backoff.attempts(),
                        self.committed
                    )))
                }
            }
        }

        Ok((applied, dropped))
    }

    fn is_stale(&self, record: &ChangeRecord) -> bool {
        match self.applied_sequences.get(&sequence_key(record)) {
            Some(last) => record.sequence <= *last,
            None => false,
        }
    }

    fn mark_applied(&mut self, record: &ChangeRecord) {
        let key = sequence_key(record);
        if record.is_delete() {
            self.applied_sequences.remove(&key);
        } else {
            let entry = self.applied_sequences.entry(key).or_insert(0);
            if record.sequence > *entry {
                *entry = record.sequence;
            }
        }
    }
}

/// Document ids are unique within an entity kind, so the stale-sequence
/// map keys on both.
fn sequence_key(record: &ChangeRecord) -> String {
    match record.entity_kind {
        EntityKind::Parent => format!("p:{}", record.document_id),
        EntityKind::Child => format!("c:{}", record.document_id),
    }
}

/// Split pairs into chunks bounded by action count and payload bytes; a
/// single oversized operation still ships alone.
fn chunk_by_size(
    pairs: Vec<(ChangeRecord, BulkOp)>,
    max_actions: usize,
    max_bytes: usize,
) -> Vec<Vec<(ChangeRecord, BulkOp)>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;

    for pair in pairs {
        let size = op_size(&pair.1);
        let over_bytes = !current.is_empty() && current_bytes + size > max_bytes;
        let over_actions = current.len() >= max_actions.max(1);
        if over_bytes || over_actions {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(pair);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::BulkItemStatus;
    use async_trait::async_trait;
    use bson::doc;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use sync_core::DispatchQueue;

    #[derive(Default)]
    struct MockSinkInner {
        /// Every bulk call, by operation id.
        calls: Mutex<Vec<Vec<String>>>,
        /// Remaining 503 rejections per operation id.
        transient_failures: Mutex<HashMap<String, u32>>,
        /// Operation ids permanently rejected with 400.
        permanent_failures: Mutex<HashSet<String>>,
        /// When set, every bulk call fails at the transport level.
        transport_down: Mutex<bool>,
    }

    #[derive(Clone, Default)]
    struct MockSink {
        inner: Arc<MockSinkInner>,
    }

    impl MockSink {
        fn calls(&self) -> Vec<Vec<String>> {
            self.inner.calls.lock().unwrap().clone()
        }

        fn fail_transiently(&self, id: &str, times: u32) {
            self.inner
                .transient_failures
                .lock()
                .unwrap()
                .insert(id.to_string(), times);
        }

        fn fail_permanently(&self, id: &str) {
            self.inner
                .permanent_failures
                .lock()
                .unwrap()
                .insert(id.to_string());
        }
    }

    #[async_trait]
    impl SearchSink for MockSink {
        async fn ensure_index(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn bulk(&self, ops: &[BulkOp]) -> anyhow::Result<Vec<BulkItemStatus>> {
            if *self.inner.transport_down.lock().unwrap() {
                anyhow::bail!("connection refused");
            }

            self.inner
                .calls
                .lock()
                .unwrap()
                .push(ops.iter().map(|op| op.id().to_string()).collect());

            let mut statuses = Vec::new();
            for op in ops {
                let id = op.id().to_string();
                if self.inner.permanent_failures.lock().unwrap().contains(&id) {
                    statuses.push(BulkItemStatus {
                        status: 400,
                        error: Some("mapper_parsing_exception: bad field".to_string()),
                    });
                    continue;
                }
                let mut transient = self.inner.transient_failures.lock().unwrap();
                if let Some(remaining) = transient.get_mut(&id) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        statuses.push(BulkItemStatus {
                            status: 503,
                            error: Some("unavailable".to_string()),
                        });
                        continue;
                    }
                }
                statuses.push(BulkItemStatus {
                    status: 200,
                    error: None,
                });
            }
            Ok(statuses)
        }
    }

    #[derive(Clone, Default)]
    struct MockCommitter {
        positions: Arc<Mutex<Vec<SourcePosition>>>,
    }

    impl MockCommitter {
        fn committed(&self) -> Vec<SourcePosition> {
            self.positions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PositionCommitter for MockCommitter {
        async fn commit(&self, position: SourcePosition) -> anyhow::Result<()> {
            self.positions.lock().unwrap().push(position);
            Ok(())
        }
    }

    fn fast_config() -> WriterConfig {
        WriterConfig {
            max_actions: 100,
            max_bytes: 1024 * 1024,
            flush_interval: Duration::from_millis(10),
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                max_retries: 3,
            },
        }
    }

    fn writer(
        sink: MockSink,
        committer: MockCommitter,
    ) -> IndexWriter<MockSink, MockCommitter> {
        IndexWriter::new(
            sink,
            committer,
            EsOpts::new("http://localhost:9200", "testindex"),
            fast_config(),
            SourcePosition::default(),
        )
    }

    fn upsert(id: &str, seq: u64, time: u32) -> ChangeRecord {
        ChangeRecord::parent_upsert(
            id,
            doc! {"text": "x"},
            SourcePosition::new(time, 0),
            seq,
        )
    }

    #[tokio::test]
    async fn test_apply_commits_max_position() {
        let (sink, committer) = (MockSink::default(), MockCommitter::default());
        let mut writer = writer(sink.clone(), committer.clone());

        let outcome = writer
            .apply(vec![
                upsert("a", 1, 5),
                upsert("b", 1, 6),
                upsert("c", 1, 4),
            ])
            .await
            .unwrap();

        assert_eq!(outcome.applied, 3);
        assert_eq!(outcome.committed, Some(SourcePosition::new(6, 0)));
        assert_eq!(committer.committed(), vec![SourcePosition::new(6, 0)]);
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_sequence_skipped() {
        let (sink, committer) = (MockSink::default(), MockCommitter::default());
        let mut writer = writer(sink.clone(), committer.clone());

        writer.apply(vec![upsert("a", 2, 1)]).await.unwrap();
        let outcome = writer.apply(vec![upsert("a", 1, 2)]).await.unwrap();

        assert_eq!(outcome.skipped_stale, 1);
        assert_eq!(outcome.applied, 0);
        // No second bulk call happened for the stale-only batch.
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_with_higher_sequence_applies() {
        let (sink, committer) = (MockSink::default(), MockCommitter::default());
        let mut writer = writer(sink.clone(), committer.clone());

        writer.apply(vec![upsert("a", 1, 1)]).await.unwrap();
        // Cursor replay re-translates the same document with a new sequence.
        let outcome = writer.apply(vec![upsert("a", 2, 1)]).await.unwrap();
        assert_eq!(outcome.applied, 1);
    }

    #[tokio::test]
    async fn test_delete_evicts_sequence_entry() {
        let (sink, committer) = (MockSink::default(), MockCommitter::default());
        let mut writer = writer(sink.clone(), committer.clone());

        writer.apply(vec![upsert("a", 5, 1)]).await.unwrap();
        writer
            .apply(vec![ChangeRecord::parent_delete(
                "a",
                SourcePosition::new(2, 0),
                6,
            )])
            .await
            .unwrap();

        // A re-created document restarts at sequence 1 and must apply.
        let outcome = writer.apply(vec![upsert("a", 1, 3)]).await.unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.skipped_stale, 0);
    }

    #[tokio::test]
    async fn test_partial_failure_retries_only_failed_subset() {
        let (sink, committer) = (MockSink::default(), MockCommitter::default());
        sink.fail_transiently("b", 2);
        let mut writer = writer(sink.clone(), committer.clone());

        let outcome = writer
            .apply(vec![
                upsert("a", 1, 1),
                upsert("b", 1, 1),
                upsert("c", 1, 1),
            ])
            .await
            .unwrap();

        assert_eq!(outcome.applied, 3);
        let calls = sink.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], vec!["a", "b", "c"]);
        assert_eq!(calls[1], vec!["b"]);
        assert_eq!(calls[2], vec!["b"]);
        // Checkpoint held until the whole batch resolved.
        assert_eq!(committer.committed().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_rejection_drops_without_retry() {
        let (sink, committer) = (MockSink::default(), MockCommitter::default());
        sink.fail_permanently("bad");
        let mut writer = writer(sink.clone(), committer.clone());

        let outcome = writer
            .apply(vec![upsert("good", 1, 1), upsert("bad", 1, 1)])
            .await
            .unwrap();

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(sink.calls().len(), 1);
        // The pipeline continues: the batch still commits.
        assert_eq!(outcome.committed, Some(SourcePosition::new(1, 0)));
    }

    #[tokio::test]
    async fn test_retry_ceiling_is_fatal_and_holds_checkpoint() {
        let (sink, committer) = (MockSink::default(), MockCommitter::default());
        sink.fail_transiently("a", u32::MAX);
        let mut writer = writer(sink.clone(), committer.clone());

        let err = writer.apply(vec![upsert("a", 1, 1)]).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(committer.committed().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_is_fatal_after_ceiling() {
        let (sink, committer) = (MockSink::default(), MockCommitter::default());
        *sink.inner.transport_down.lock().unwrap() = true;
        let mut writer = writer(sink.clone(), committer.clone());

        let err = writer.apply(vec![upsert("a", 1, 1)]).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(committer.committed().is_empty());
    }

    #[tokio::test]
    async fn test_scan_records_do_not_advance_checkpoint() {
        let (sink, committer) = (MockSink::default(), MockCommitter::default());
        let mut writer = writer(sink.clone(), committer.clone());

        let outcome = writer
            .apply(vec![ChangeRecord::parent_upsert(
                "scanned",
                doc! {"text": "x"},
                SourcePosition::default(),
                1,
            )])
            .await
            .unwrap();

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.committed, None);
        assert!(committer.committed().is_empty());
    }

    #[tokio::test]
    async fn test_chunking_respects_action_bound() {
        let pairs: Vec<(ChangeRecord, BulkOp)> = (0..5)
            .map(|i| {
                let record = upsert(&format!("d{i}"), 1, 1);
                let op = record_to_op(
                    &record,
                    &EsOpts::new("http://localhost:9200", "testindex"),
                )
                .unwrap();
                (record, op)
            })
            .collect();

        let chunks = chunk_by_size(pairs, 2, usize::MAX);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[2].len(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_cancelled() {
        let (sink, committer) = (MockSink::default(), MockCommitter::default());
        let writer = writer(sink.clone(), committer.clone());

        let (tx, rx) = DispatchQueue::bounded(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(writer.run(rx, cancel.clone()));

        tx.send(upsert("a", 1, 1)).await.unwrap();
        tx.send(upsert("b", 1, 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        handle.await.unwrap().unwrap();
        assert!(!sink.calls().is_empty());
        assert_eq!(committer.committed().last(), Some(&SourcePosition::new(2, 0)));
    }
}
