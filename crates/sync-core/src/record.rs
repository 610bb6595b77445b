//! Normalized change records flowing through the pipeline.

use bson::Document;

use crate::SourcePosition;

/// Raw change-log operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOp {
    Insert,
    Update,
    Delete,
}

/// A partial-update delta from the change log.
///
/// Oplog update entries carry `$set`/`$unset` documents rather than the
/// full post-image, so the delta is not append/remove-aware for arrays.
#[derive(Debug, Clone, Default)]
pub struct UpdateDelta {
    /// Fields assigned by the update, in source order.
    pub set: Document,
    /// Field names removed by the update.
    pub unset: Vec<String>,
}

impl UpdateDelta {
    /// Whether the delta touches the given top-level field, either by
    /// setting it (including dotted paths into it) or unsetting it.
    pub fn touches_field(&self, field: &str) -> bool {
        let dotted = format!("{field}.");
        self.set
            .keys()
            .chain(self.unset.iter())
            .any(|k| k == field || k.starts_with(&dotted))
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }
}

/// One parsed source change-log entry, in log order.
#[derive(Debug, Clone)]
pub struct RawChangeEntry {
    pub op: RawOp,
    /// Source namespace in `database.collection` form.
    pub namespace: String,
    /// Stringified `_id` of the affected document.
    pub document_id: String,
    /// Full document for inserts and whole-document replacements.
    pub document: Option<Document>,
    /// Set/unset delta for partial updates.
    pub delta: Option<UpdateDelta>,
    pub position: SourcePosition,
}

/// Destination mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Upsert,
    Delete,
}

/// Whether a record targets a top-level document or an embedded child
/// promoted to its own destination document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Parent,
    Child,
}

/// One normalized destination mutation.
///
/// Created by the translator, consumed exactly once by the index writer,
/// and discarded after a successful or permanently-failed apply. Durability
/// of progress is carried solely by the committed [`SourcePosition`].
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub operation: Operation,
    pub entity_kind: EntityKind,
    /// Destination document id, unique within (index, entity kind).
    pub document_id: String,
    /// Owning parent id; present exactly when `entity_kind` is `Child`.
    pub parent_id: Option<String>,
    /// Upsert payload in source field order. `None` for deletes.
    pub payload: Option<Document>,
    /// Merge-upsert rather than whole-document replace. Set for partial
    /// updates so the destination applies upsert-with-merge semantics.
    pub merge: bool,
    /// Change-log offset this record was derived from.
    pub position: SourcePosition,
    /// Per-document monotonically increasing counter used to drop stale
    /// re-deliveries after cursor replay.
    pub sequence: u64,
}

impl ChangeRecord {
    pub fn parent_upsert(
        document_id: impl Into<String>,
        payload: Document,
        position: SourcePosition,
        sequence: u64,
    ) -> Self {
        Self {
            operation: Operation::Upsert,
            entity_kind: EntityKind::Parent,
            document_id: document_id.into(),
            parent_id: None,
            payload: Some(payload),
            merge: false,
            position,
            sequence,
        }
    }

    /// Partial parent update applied as upsert-with-merge.
    pub fn parent_merge(
        document_id: impl Into<String>,
        payload: Document,
        position: SourcePosition,
        sequence: u64,
    ) -> Self {
        Self {
            merge: true,
            ..Self::parent_upsert(document_id, payload, position, sequence)
        }
    }

    pub fn child_upsert(
        document_id: impl Into<String>,
        parent_id: impl Into<String>,
        payload: Document,
        position: SourcePosition,
        sequence: u64,
    ) -> Self {
        Self {
            operation: Operation::Upsert,
            entity_kind: EntityKind::Child,
            document_id: document_id.into(),
            parent_id: Some(parent_id.into()),
            payload: Some(payload),
            merge: false,
            position,
            sequence,
        }
    }

    pub fn parent_delete(
        document_id: impl Into<String>,
        position: SourcePosition,
        sequence: u64,
    ) -> Self {
        Self {
            operation: Operation::Delete,
            entity_kind: EntityKind::Parent,
            document_id: document_id.into(),
            parent_id: None,
            payload: None,
            merge: false,
            position,
            sequence,
        }
    }

    pub fn child_delete(
        document_id: impl Into<String>,
        parent_id: impl Into<String>,
        position: SourcePosition,
        sequence: u64,
    ) -> Self {
        Self {
            operation: Operation::Delete,
            entity_kind: EntityKind::Child,
            document_id: document_id.into(),
            parent_id: Some(parent_id.into()),
            payload: None,
            merge: false,
            position,
            sequence,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    pub fn is_child(&self) -> bool {
        self.entity_kind == EntityKind::Child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_child_records_carry_parent_id() {
        let rec = ChangeRecord::child_upsert(
            "d1/0",
            "d1",
            doc! {"text": "foo"},
            SourcePosition::new(1, 0),
            1,
        );
        assert_eq!(rec.parent_id.as_deref(), Some("d1"));
        assert!(rec.is_child());
        assert!(!rec.is_delete());
    }

    #[test]
    fn test_parent_records_have_no_parent_id() {
        let rec = ChangeRecord::parent_upsert(
            "d1",
            doc! {"text": "parent"},
            SourcePosition::new(1, 0),
            1,
        );
        assert!(rec.parent_id.is_none());
        assert!(!rec.merge);
    }

    #[test]
    fn test_merge_upsert_flag() {
        let rec =
            ChangeRecord::parent_merge("d1", doc! {"text": "new"}, SourcePosition::new(2, 0), 2);
        assert!(rec.merge);
        assert_eq!(rec.operation, Operation::Upsert);
    }

    #[test]
    fn test_deletes_carry_no_payload() {
        let rec = ChangeRecord::parent_delete("d1", SourcePosition::new(3, 0), 3);
        assert!(rec.payload.is_none());
        assert!(rec.is_delete());
    }

    #[test]
    fn test_delta_touches_field() {
        let delta = UpdateDelta {
            set: doc! {"tweets.0.text": "x"},
            unset: vec![],
        };
        assert!(delta.touches_field("tweets"));
        assert!(!delta.touches_field("text"));

        let delta = UpdateDelta {
            set: doc! {"title": "y"},
            unset: vec!["tweets".to_string()],
        };
        assert!(delta.touches_field("tweets"));

        let delta = UpdateDelta {
            set: doc! {"tweetsextra": "z"},
            unset: vec![],
        };
        assert!(!delta.touches_field("tweets"));
    }
}
