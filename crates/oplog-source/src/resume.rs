//! Oplog resume-position checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_core::SourcePosition;

/// Checkpoint pairing an oplog position with the time it was captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogCheckpoint {
    /// Last fully-applied oplog position.
    pub position: SourcePosition,
    /// When the checkpoint was created.
    pub timestamp: DateTime<Utc>,
}

impl OplogCheckpoint {
    pub fn new(position: SourcePosition) -> Self {
        Self {
            position,
            timestamp: Utc::now(),
        }
    }
}

impl checkpoint::Checkpoint for OplogCheckpoint {
    const SOURCE_TYPE: &'static str = "mongodb-oplog";

    fn to_cli_string(&self) -> String {
        format!("{}:{}", self.position, self.timestamp.to_rfc3339())
    }

    fn from_cli_string(s: &str) -> anyhow::Result<Self> {
        let (position, timestamp) = s.split_once(':').ok_or_else(|| {
            anyhow::anyhow!("Invalid oplog checkpoint format: expected 'time.ordinal:timestamp', got '{s}'")
        })?;

        Ok(Self {
            position: position.parse()?,
            timestamp: DateTime::parse_from_rfc3339(timestamp)
                .map_err(|e| anyhow::anyhow!("Invalid timestamp format: {e}"))?
                .with_timezone(&Utc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint::{Checkpoint, CheckpointFile, FilesystemStore, SyncManager, SyncPhase};
    use tempfile::TempDir;

    #[test]
    fn test_cli_string_roundtrip() {
        let original = OplogCheckpoint::new(SourcePosition::new(1700000000, 5));
        let decoded = OplogCheckpoint::from_cli_string(&original.to_cli_string()).unwrap();

        assert_eq!(original.position, decoded.position);
        // RFC 3339 keeps sub-second precision, but compare seconds to stay
        // robust against formatting differences.
        assert_eq!(
            original.timestamp.timestamp(),
            decoded.timestamp.timestamp()
        );
    }

    #[test]
    fn test_cli_string_rejects_bad_position() {
        assert!(OplogCheckpoint::from_cli_string("garbage:2024-01-01T00:00:00Z").is_err());
        assert!(OplogCheckpoint::from_cli_string("no-separator").is_err());
    }

    #[test]
    fn test_cli_string_rejects_bad_timestamp() {
        assert!(OplogCheckpoint::from_cli_string("12.3:not-a-timestamp").is_err());
    }

    #[test]
    fn test_checkpoint_file_roundtrip() {
        let original = OplogCheckpoint::new(SourcePosition::new(42, 1));
        let file = CheckpointFile::new(&original, SyncPhase::Committed).unwrap();

        assert_eq!(file.source_type(), OplogCheckpoint::SOURCE_TYPE);
        let decoded: OplogCheckpoint = file.parse().unwrap();
        assert_eq!(original.position, decoded.position);
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let manager = SyncManager::new(FilesystemStore::new(tmp.path()));

        let original = OplogCheckpoint::new(SourcePosition::new(100, 2));
        manager
            .emit_checkpoint(&original, SyncPhase::Committed)
            .await
            .unwrap();

        let loaded: Option<OplogCheckpoint> = manager
            .read_checkpoint(SyncPhase::Committed)
            .await
            .unwrap();
        assert_eq!(loaded.unwrap().position, original.position);
    }

    #[test]
    fn test_source_type() {
        assert_eq!(OplogCheckpoint::SOURCE_TYPE, "mongodb-oplog");
    }
}
