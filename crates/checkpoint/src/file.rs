//! Self-describing checkpoint envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Checkpoint, SyncPhase};

/// Storage-agnostic wrapper around a source-specific checkpoint.
///
/// The envelope records which source type produced the checkpoint so a
/// load against the wrong type fails loudly instead of resuming from a
/// position that means something else entirely.
///
/// # File format
///
/// ```json
/// {
///     "source_type": "mongodb-oplog",
///     "checkpoint": { "position": { "time": 1700000000, "ordinal": 3 }, ... },
///     "phase": "Committed",
///     "created_at": "2024-01-01T00:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Source type identifier (e.g. "mongodb-oplog").
    pub source_type: String,
    /// Serialized checkpoint payload.
    pub checkpoint: serde_json::Value,
    /// Pipeline phase this checkpoint marks.
    pub phase: SyncPhase,
    /// When the envelope was created.
    pub created_at: DateTime<Utc>,
}

impl CheckpointFile {
    /// Wrap a source-specific checkpoint for storage.
    pub fn new<C: Checkpoint>(checkpoint: &C, phase: SyncPhase) -> anyhow::Result<Self> {
        Ok(Self {
            source_type: C::SOURCE_TYPE.to_string(),
            checkpoint: serde_json::to_value(checkpoint)?,
            phase,
            created_at: Utc::now(),
        })
    }

    /// Extract the typed checkpoint, validating the source type.
    pub fn parse<C: Checkpoint>(&self) -> anyhow::Result<C> {
        if self.source_type != C::SOURCE_TYPE {
            anyhow::bail!(
                "Checkpoint type mismatch: expected '{}', found '{}'",
                C::SOURCE_TYPE,
                self.source_type
            );
        }
        Ok(serde_json::from_value(self.checkpoint.clone())?)
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn phase(&self) -> &SyncPhase {
        &self.phase
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestCheckpoint {
        offset: u64,
    }

    impl Checkpoint for TestCheckpoint {
        const SOURCE_TYPE: &'static str = "test";

        fn to_cli_string(&self) -> String {
            self.offset.to_string()
        }

        fn from_cli_string(s: &str) -> anyhow::Result<Self> {
            Ok(Self { offset: s.parse()? })
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let original = TestCheckpoint { offset: 42 };
        let file = CheckpointFile::new(&original, SyncPhase::Committed).unwrap();
        assert_eq!(file.source_type(), "test");
        assert_eq!(file.phase(), &SyncPhase::Committed);

        let parsed: TestCheckpoint = file.parse().unwrap();
        assert_eq!(parsed.offset, 42);
    }

    #[test]
    fn test_parse_rejects_type_mismatch() {
        let mut file =
            CheckpointFile::new(&TestCheckpoint { offset: 1 }, SyncPhase::FullScanStart).unwrap();
        file.source_type = "something-else".to_string();

        let result: anyhow::Result<TestCheckpoint> = file.parse();
        assert!(result.unwrap_err().to_string().contains("type mismatch"));
    }
}
