//! Oplog document parsing.
//!
//! Turns raw `local.oplog.rs` documents into [`RawChangeEntry`] values.
//! Entries that carry no user-visible mutation (no-ops, commands, internal
//! chunk migrations) parse to `None`; structurally broken entries are DATA
//! errors so one bad record never stalls the stream.

use bson::{Bson, Document};
use sync_core::{RawChangeEntry, RawOp, SourcePosition, SyncError, UpdateDelta};

/// Stringify a BSON `_id` the way the destination keys documents.
pub fn id_to_string(id: &Bson) -> Result<String, SyncError> {
    match id {
        Bson::ObjectId(oid) => Ok(oid.to_string()),
        Bson::String(s) => Ok(s.clone()),
        Bson::Int32(i) => Ok(i.to_string()),
        Bson::Int64(i) => Ok(i.to_string()),
        other => Err(SyncError::data(format!(
            "unsupported _id type: {other:?}"
        ))),
    }
}

/// Parse one oplog document.
///
/// Returns `Ok(None)` for entries the pipeline ignores:
/// - ops other than `i`/`u`/`d` (no-ops, commands)
/// - entries flagged `fromMigrate` (internal chunk migrations)
pub fn parse_oplog_document(doc: &Document) -> Result<Option<RawChangeEntry>, SyncError> {
    let position: SourcePosition = doc
        .get_timestamp("ts")
        .map_err(|e| SyncError::data(format!("oplog entry missing ts: {e}")))?
        .into();

    let op = doc
        .get_str("op")
        .map_err(|e| SyncError::data(format!("oplog entry missing op: {e}")))?;

    if doc.get_bool("fromMigrate").unwrap_or(false) {
        tracing::trace!("Skipping fromMigrate entry at {position}");
        return Ok(None);
    }

    let op = match op {
        "i" => RawOp::Insert,
        "u" => RawOp::Update,
        "d" => RawOp::Delete,
        other => {
            tracing::trace!("Ignoring oplog op '{other}' at {position}");
            return Ok(None);
        }
    };

    let namespace = doc
        .get_str("ns")
        .map_err(|e| SyncError::data(format!("oplog entry missing ns: {e}")))?
        .to_string();

    let o = doc
        .get_document("o")
        .map_err(|e| SyncError::data(format!("oplog entry missing o: {e}")))?;

    match op {
        RawOp::Insert => {
            let document_id = id_to_string(o.get("_id").ok_or_else(|| {
                SyncError::data("insert entry document has no _id".to_string())
            })?)?;
            Ok(Some(RawChangeEntry {
                op,
                namespace,
                document_id,
                document: Some(o.clone()),
                delta: None,
                position,
            }))
        }
        RawOp::Update => {
            // Updates identify the target through o2.
            let o2 = doc
                .get_document("o2")
                .map_err(|e| SyncError::data(format!("update entry missing o2: {e}")))?;
            let document_id = id_to_string(o2.get("_id").ok_or_else(|| {
                SyncError::data("update entry o2 has no _id".to_string())
            })?)?;

            let (document, delta) = classify_update_body(o);
            Ok(Some(RawChangeEntry {
                op,
                namespace,
                document_id,
                document,
                delta,
                position,
            }))
        }
        RawOp::Delete => {
            let document_id = id_to_string(o.get("_id").ok_or_else(|| {
                SyncError::data("delete entry document has no _id".to_string())
            })?)?;
            Ok(Some(RawChangeEntry {
                op,
                namespace,
                document_id,
                document: None,
                delta: None,
                position,
            }))
        }
    }
}

/// Split an update `o` body into (replacement document, delta).
///
/// Three shapes appear on the wire:
/// - whole-document replacement: no `$`-prefixed keys
/// - classic modifier update: `$set` / `$unset`
/// - v2 pipeline diffs (`$v: 2`): not decoded here; both fields come back
///   `None`, which the translator treats as "refetch the full document"
fn classify_update_body(o: &Document) -> (Option<Document>, Option<UpdateDelta>) {
    let has_modifiers = o.keys().any(|k| k.starts_with('$'));
    if !has_modifiers {
        return (Some(o.clone()), None);
    }

    let set = o
        .get_document("$set")
        .cloned()
        .unwrap_or_default();
    let unset = o
        .get_document("$unset")
        .map(|d| d.keys().cloned().collect())
        .unwrap_or_default();

    let delta = UpdateDelta { set, unset };
    if delta.is_empty() {
        // $v:2 diff or another modifier shape we do not decode.
        (None, None)
    } else {
        (None, Some(delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId, Timestamp};

    fn ts(time: u32, increment: u32) -> Timestamp {
        Timestamp { time, increment }
    }

    #[test]
    fn test_parse_insert_entry() {
        let raw = doc! {
            "ts": ts(100, 1),
            "op": "i",
            "ns": "blog.posts",
            "o": {"_id": "d1", "text": "parent", "tweets": [{"text": "foo"}]},
        };
        let entry = parse_oplog_document(&raw).unwrap().unwrap();
        assert_eq!(entry.op, RawOp::Insert);
        assert_eq!(entry.namespace, "blog.posts");
        assert_eq!(entry.document_id, "d1");
        assert_eq!(entry.position, SourcePosition::new(100, 1));
        assert!(entry.document.is_some());
        assert!(entry.delta.is_none());
    }

    #[test]
    fn test_parse_set_unset_update() {
        let raw = doc! {
            "ts": ts(101, 1),
            "op": "u",
            "ns": "blog.posts",
            "o2": {"_id": "d1"},
            "o": {"$set": {"text": "changed"}, "$unset": {"obsolete": 1}},
        };
        let entry = parse_oplog_document(&raw).unwrap().unwrap();
        assert_eq!(entry.op, RawOp::Update);
        assert!(entry.document.is_none());
        let delta = entry.delta.unwrap();
        assert_eq!(delta.set.get_str("text").unwrap(), "changed");
        assert_eq!(delta.unset, vec!["obsolete".to_string()]);
    }

    #[test]
    fn test_parse_replacement_update() {
        let raw = doc! {
            "ts": ts(102, 1),
            "op": "u",
            "ns": "blog.posts",
            "o2": {"_id": "d1"},
            "o": {"_id": "d1", "text": "replaced", "tweets": []},
        };
        let entry = parse_oplog_document(&raw).unwrap().unwrap();
        assert!(entry.document.is_some());
        assert!(entry.delta.is_none());
    }

    #[test]
    fn test_parse_v2_diff_update_forces_refetch() {
        let raw = doc! {
            "ts": ts(103, 1),
            "op": "u",
            "ns": "blog.posts",
            "o2": {"_id": "d1"},
            "o": {"$v": 2, "diff": {"u": {"text": "x"}}},
        };
        let entry = parse_oplog_document(&raw).unwrap().unwrap();
        // Neither a document nor a decoded delta: the translator refetches.
        assert!(entry.document.is_none());
        assert!(entry.delta.is_none());
    }

    #[test]
    fn test_parse_delete_entry() {
        let raw = doc! {
            "ts": ts(104, 1),
            "op": "d",
            "ns": "blog.posts",
            "o": {"_id": "d1"},
        };
        let entry = parse_oplog_document(&raw).unwrap().unwrap();
        assert_eq!(entry.op, RawOp::Delete);
        assert_eq!(entry.document_id, "d1");
        assert!(entry.document.is_none());
    }

    #[test]
    fn test_noop_and_command_entries_skipped() {
        for op in ["n", "c"] {
            let raw = doc! {
                "ts": ts(105, 1),
                "op": op,
                "ns": "blog.$cmd",
                "o": {"msg": "periodic noop"},
            };
            assert!(parse_oplog_document(&raw).unwrap().is_none());
        }
    }

    #[test]
    fn test_from_migrate_entries_skipped() {
        let raw = doc! {
            "ts": ts(106, 1),
            "op": "i",
            "ns": "blog.posts",
            "fromMigrate": true,
            "o": {"_id": "d1"},
        };
        assert!(parse_oplog_document(&raw).unwrap().is_none());
    }

    #[test]
    fn test_malformed_entry_is_data_error() {
        let raw = doc! {
            "ts": ts(107, 1),
            "op": "i",
            "ns": "blog.posts",
            "o": {"no_id": true},
        };
        let err = parse_oplog_document(&raw).unwrap_err();
        assert!(err.is_data());
    }

    #[test]
    fn test_object_id_stringification() {
        let oid = ObjectId::new();
        assert_eq!(id_to_string(&Bson::ObjectId(oid)).unwrap(), oid.to_string());
        assert_eq!(id_to_string(&Bson::Int64(9)).unwrap(), "9");
        assert!(id_to_string(&Bson::Null).is_err());
    }
}
