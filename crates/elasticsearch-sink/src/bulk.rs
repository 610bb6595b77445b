//! Bulk operation building and response classification.

use bson::Bson;
use serde_json::{json, Value};
use sync_core::{ChangeRecord, EntityKind, Operation, SyncError};

use crate::EsOpts;

/// One operation in a `_bulk` request.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOp {
    /// Insert-or-replace by id.
    Index {
        id: String,
        routing: Option<String>,
        document: Value,
    },
    /// Upsert-with-merge (`doc_as_upsert`).
    Update {
        id: String,
        routing: Option<String>,
        doc: Value,
    },
    /// Delete by id if present.
    Delete {
        id: String,
        routing: Option<String>,
    },
}

impl BulkOp {
    pub fn id(&self) -> &str {
        match self {
            BulkOp::Index { id, .. } | BulkOp::Update { id, .. } | BulkOp::Delete { id, .. } => id,
        }
    }

    fn is_delete(&self) -> bool {
        matches!(self, BulkOp::Delete { .. })
    }
}

/// Per-operation result from a bulk response.
#[derive(Debug, Clone)]
pub struct BulkItemStatus {
    pub status: u16,
    pub error: Option<String>,
}

/// How the writer must react to one bulk item result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Applied (or delete of an absent document).
    Success,
    /// Destination momentarily unable; retry the operation.
    Retry,
    /// Permanently rejected; log and drop the record.
    Drop,
}

/// Classify one item result against the operation that produced it.
pub fn classify(op: &BulkOp, item: &BulkItemStatus) -> ItemOutcome {
    match item.status {
        200..=299 => ItemOutcome::Success,
        // Deleting a document that is not there satisfies delete-if-present.
        404 if op.is_delete() => ItemOutcome::Success,
        408 | 429 | 502 | 503 | 504 => ItemOutcome::Retry,
        _ => ItemOutcome::Drop,
    }
}

/// Build a bulk operation from one change record.
///
/// Parent documents carry the join field as their relation name; children
/// carry `{name, parent}` and are routed by the parent id so they land on
/// the parent's shard. Merge upserts become `update` + `doc_as_upsert` so
/// the destination merges only the changed fields.
pub fn record_to_op(record: &ChangeRecord, opts: &EsOpts) -> Result<BulkOp, SyncError> {
    let routing = match record.entity_kind {
        EntityKind::Parent => None,
        EntityKind::Child => Some(record.parent_id.clone().ok_or_else(|| {
            SyncError::data(format!("child record {} has no parent id", record.document_id))
        })?),
    };

    match record.operation {
        Operation::Delete => Ok(BulkOp::Delete {
            id: record.document_id.clone(),
            routing,
        }),
        Operation::Upsert => {
            let payload = record.payload.as_ref().ok_or_else(|| {
                SyncError::data(format!("upsert record {} has no payload", record.document_id))
            })?;

            let mut document = Bson::Document(payload.clone()).into_relaxed_extjson();
            let fields = document.as_object_mut().ok_or_else(|| {
                SyncError::data(format!(
                    "payload of {} did not serialize to an object",
                    record.document_id
                ))
            })?;

            let join_value = match record.entity_kind {
                EntityKind::Parent => json!(opts.parent_relation),
                EntityKind::Child => json!({
                    "name": opts.child_relation,
                    "parent": record.parent_id,
                }),
            };
            fields.insert(opts.join_field.clone(), join_value);

            if record.merge {
                Ok(BulkOp::Update {
                    id: record.document_id.clone(),
                    routing,
                    doc: document,
                })
            } else {
                Ok(BulkOp::Index {
                    id: record.document_id.clone(),
                    routing,
                    document,
                })
            }
        }
    }
}

/// Render operations as an NDJSON `_bulk` body.
pub fn build_bulk_body(ops: &[BulkOp]) -> anyhow::Result<String> {
    let mut body = String::new();
    for op in ops {
        let (action, source) = action_and_source(op);
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        if let Some(source) = source {
            body.push_str(&serde_json::to_string(&source)?);
            body.push('\n');
        }
    }
    Ok(body)
}

/// Approximate wire size of one operation, used for byte-bounded batching.
pub fn op_size(op: &BulkOp) -> usize {
    let (action, source) = action_and_source(op);
    let action_len = serde_json::to_string(&action).map(|s| s.len()).unwrap_or(64);
    let source_len = source
        .and_then(|s| serde_json::to_string(&s).ok())
        .map(|s| s.len())
        .unwrap_or(0);
    action_len + source_len + 2
}

fn action_and_source(op: &BulkOp) -> (Value, Option<Value>) {
    fn meta(id: &str, routing: &Option<String>) -> Value {
        let mut meta = json!({"_id": id});
        if let Some(routing) = routing {
            meta["routing"] = json!(routing);
        }
        meta
    }

    match op {
        BulkOp::Index {
            id,
            routing,
            document,
        } => (json!({"index": meta(id, routing)}), Some(document.clone())),
        BulkOp::Update { id, routing, doc } => (
            json!({"update": meta(id, routing)}),
            Some(json!({"doc": doc, "doc_as_upsert": true})),
        ),
        BulkOp::Delete { id, routing } => (json!({"delete": meta(id, routing)}), None),
    }
}

/// Extract per-item statuses from a `_bulk` response body.
pub fn parse_bulk_response(response: &Value) -> anyhow::Result<Vec<BulkItemStatus>> {
    let items = response
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("bulk response has no items array"))?;

    let mut statuses = Vec::with_capacity(items.len());
    for item in items {
        // Each item is a single-key object named after the action.
        let result = item
            .as_object()
            .and_then(|o| o.values().next())
            .ok_or_else(|| anyhow::anyhow!("malformed bulk response item: {item}"))?;

        let status = result
            .get("status")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("bulk response item has no status: {result}"))?
            as u16;

        let error = result.get("error").map(|e| {
            let error_type = e.get("type").and_then(Value::as_str).unwrap_or("unknown");
            let reason = e.get("reason").and_then(Value::as_str).unwrap_or("");
            format!("{error_type}: {reason}")
        });

        statuses.push(BulkItemStatus { status, error });
    }
    Ok(statuses)
}
