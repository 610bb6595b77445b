//! Raw change entries to normalized change records.
//!
//! Decomposition is pure and deterministic given the source document: one
//! parent record (payload stripped of the embedded child array) plus one
//! child record per array element, with child ids derived from the parent
//! id and the element's own identity. The translator owns the per-parent
//! known-child-id map used to emit deletes for children that vanish from
//! the array, and the per-document sequence counters the writer uses to
//! drop stale re-deliveries.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use bson::{Bson, Document};
use mongodb::Collection;
use sync_core::{ChangeRecord, RawChangeEntry, RawOp, SourcePosition, SyncError};

use crate::entry::id_to_string;

/// Follow-up fetch of the current full parent document.
///
/// Oplog deltas are not append/remove-aware for arrays, so a delta that
/// touches the child field forces a re-read of the whole parent. The trait
/// keeps the translator testable without a running source.
#[async_trait]
pub trait ParentFetcher: Send + Sync {
    /// Current full document for the id, or `None` if it no longer exists.
    async fn fetch_parent(&self, id: &str) -> anyhow::Result<Option<Document>>;
}

/// Fetches parents from the mirrored MongoDB collection.
pub struct MongoParentFetcher {
    collection: Collection<Document>,
}

impl MongoParentFetcher {
    pub fn new(collection: Collection<Document>) -> Self {
        Self { collection }
    }

    /// Connect a fetcher to the mirrored collection. The client connects
    /// lazily and re-runs server selection per operation, so one fetcher
    /// instance survives replica failover and connector recovery cycles.
    pub async fn connect(opts: &crate::SourceOpts) -> anyhow::Result<Self> {
        let mut client_options =
            mongodb::options::ClientOptions::parse(&opts.source_uri).await?;
        client_options.connect_timeout = Some(std::time::Duration::from_secs(10));
        client_options.server_selection_timeout = Some(std::time::Duration::from_secs(10));
        let client = mongodb::Client::with_options(client_options)?;

        Ok(Self::new(
            client
                .database(&opts.source_database)
                .collection::<Document>(&opts.source_collection),
        ))
    }

    /// Reverse the stringification applied by [`id_to_string`] so string,
    /// ObjectId and integer ids all refetch correctly.
    fn id_filter(id: &str) -> Bson {
        if let Ok(oid) = bson::oid::ObjectId::parse_str(id) {
            return Bson::ObjectId(oid);
        }
        if let Ok(n) = id.parse::<i64>() {
            return Bson::Int64(n);
        }
        Bson::String(id.to_string())
    }
}

#[async_trait]
impl ParentFetcher for MongoParentFetcher {
    async fn fetch_parent(&self, id: &str) -> anyhow::Result<Option<Document>> {
        let filter = bson::doc! {"_id": Self::id_filter(id)};
        Ok(self.collection.find_one(filter).await?)
    }
}

/// Translates raw change-log entries into ordered change records.
pub struct ChangeTranslator<F: ParentFetcher> {
    child_field: String,
    fetcher: F,
    /// Child ids currently believed to exist per parent; evicted when the
    /// parent is deleted.
    known_children: HashMap<String, BTreeSet<String>>,
    /// Per-document strictly increasing counters. Evicted together with
    /// the writer's applied-sequence entry on delete, so a re-created
    /// document restarts cleanly on both sides.
    sequences: HashMap<String, u64>,
}

impl<F: ParentFetcher> ChangeTranslator<F> {
    pub fn new(child_field: impl Into<String>, fetcher: F) -> Self {
        Self {
            child_field: child_field.into(),
            fetcher,
            known_children: HashMap::new(),
            sequences: HashMap::new(),
        }
    }

    /// Translate one entry into zero or more records, in apply order.
    ///
    /// DATA errors mean this entry is malformed; the caller logs and moves
    /// on. Transient errors come from the follow-up parent fetch.
    pub async fn translate(
        &mut self,
        entry: &RawChangeEntry,
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        match entry.op {
            RawOp::Insert => {
                let document = entry.document.as_ref().ok_or_else(|| {
                    SyncError::data(format!("insert entry for {} has no document", entry.document_id))
                })?;
                Ok(self.replace_parent(&entry.document_id, document, entry.position))
            }
            RawOp::Update => self.translate_update(entry).await,
            RawOp::Delete => Ok(self.delete_parent(&entry.document_id, entry.position)),
        }
    }

    async fn translate_update(
        &mut self,
        entry: &RawChangeEntry,
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        // Whole-document replacement in the log: same path as insert.
        if let Some(document) = &entry.document {
            return Ok(self.replace_parent(&entry.document_id, document, entry.position));
        }

        // A decoded delta away from the child field merges into the parent
        // without touching children.
        if let Some(delta) = &entry.delta {
            if !delta.touches_field(&self.child_field) {
                let mut payload = delta.set.clone();
                for field in &delta.unset {
                    // Explicit nulls so the merge clears removed fields.
                    payload.insert(field.clone(), Bson::Null);
                }
                let sequence = self.next_sequence(&entry.document_id);
                return Ok(vec![ChangeRecord::parent_merge(
                    &entry.document_id,
                    payload,
                    entry.position,
                    sequence,
                )]);
            }
        }

        // Delta touches the child array (or could not be decoded): the log
        // does not carry enough to reconstruct the child set, so re-read
        // the full parent and emit a replace.
        let fetched = self
            .fetcher
            .fetch_parent(&entry.document_id)
            .await
            .map_err(|e| SyncError::transient(format!("parent refetch failed: {e}")))?;

        match fetched {
            Some(document) => {
                Ok(self.replace_parent(&entry.document_id, &document, entry.position))
            }
            None => {
                // Deleted between the log entry and the fetch; the delete
                // entry is behind us in the log and will clean up.
                tracing::debug!(
                    "Parent {} vanished before refetch; skipping update",
                    entry.document_id
                );
                Ok(Vec::new())
            }
        }
    }

    /// Full parent replace: parent upsert, child upserts for the current
    /// array, child deletes for ids seen before but absent now.
    fn replace_parent(
        &mut self,
        parent_id: &str,
        document: &Document,
        position: SourcePosition,
    ) -> Vec<ChangeRecord> {
        let (payload, children) = self.decompose(parent_id, document);

        let current_ids: BTreeSet<String> =
            children.iter().map(|(id, _)| id.clone()).collect();
        let previous_ids = self
            .known_children
            .insert(parent_id.to_string(), current_ids.clone())
            .unwrap_or_default();

        let mut records = Vec::with_capacity(children.len() + 2);
        let sequence = self.next_sequence(parent_id);
        records.push(ChangeRecord::parent_upsert(
            parent_id, payload, position, sequence,
        ));

        for (child_id, child_payload) in children {
            let sequence = self.next_sequence(&child_id);
            records.push(ChangeRecord::child_upsert(
                child_id,
                parent_id,
                child_payload,
                position,
                sequence,
            ));
        }

        for stale_id in previous_ids.difference(&current_ids) {
            let sequence = self.next_sequence(stale_id);
            self.sequences.remove(stale_id);
            records.push(ChangeRecord::child_delete(
                stale_id, parent_id, position, sequence,
            ));
        }

        records
    }

    /// Parent delete plus deletes for every previously observed child.
    fn delete_parent(&mut self, parent_id: &str, position: SourcePosition) -> Vec<ChangeRecord> {
        let children = self
            .known_children
            .remove(parent_id)
            .unwrap_or_default();

        let mut records = Vec::with_capacity(children.len() + 1);
        let sequence = self.next_sequence(parent_id);
        self.sequences.remove(parent_id);
        records.push(ChangeRecord::parent_delete(parent_id, position, sequence));

        for child_id in children {
            let sequence = self.next_sequence(&child_id);
            self.sequences.remove(&child_id);
            records.push(ChangeRecord::child_delete(
                child_id, parent_id, position, sequence,
            ));
        }

        records
    }

    /// Split a source document into the parent payload (child array and
    /// `_id` removed) and the child payloads with their derived ids.
    fn decompose(&self, parent_id: &str, document: &Document) -> (Document, Vec<(String, Document)>) {
        let mut payload = Document::new();
        let mut children = Vec::new();

        for (key, value) in document {
            if key == "_id" {
                continue;
            }
            if *key == self.child_field {
                match value {
                    Bson::Array(elements) => {
                        for (index, element) in elements.iter().enumerate() {
                            match element {
                                Bson::Document(child) => {
                                    let child_id =
                                        format!("{parent_id}/{}", child_key(child, index));
                                    children.push((child_id, child.clone()));
                                }
                                other => {
                                    tracing::warn!(
                                        "Skipping non-document child {index} of {parent_id}: {other:?}"
                                    );
                                }
                            }
                        }
                    }
                    other => {
                        tracing::warn!(
                            "Field '{}' of {parent_id} is not an array: {other:?}",
                            self.child_field
                        );
                    }
                }
                continue;
            }
            payload.insert(key.clone(), value.clone());
        }

        (payload, children)
    }

    fn next_sequence(&mut self, document_id: &str) -> u64 {
        let counter = self
            .sequences
            .entry(document_id.to_string())
            .or_insert(0);
        *counter += 1;
        *counter
    }
}

/// Identity of a child element within its parent: its own `_id`/`id` when
/// present, else its array index. Re-translating the same document yields
/// the same key.
fn child_key(child: &Document, index: usize) -> String {
    for field in ["_id", "id"] {
        if let Some(value) = child.get(field) {
            if let Ok(id) = id_to_string(value) {
                return id;
            }
        }
    }
    index.to_string()
}
