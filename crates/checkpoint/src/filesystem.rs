//! Filesystem-backed checkpoint storage.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::store::{CheckpointID, CheckpointStore, StoredCheckpoint};

/// Stores each checkpoint emission as its own JSON file under a directory;
/// reads resolve to the most recently written file for the phase.
///
/// Writing a fresh file per emission instead of rewriting one in place
/// means a crash mid-write can only lose the newest checkpoint, never
/// corrupt the previous one.
pub struct FilesystemStore {
    dir: PathBuf,
}

impl FilesystemStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn file_prefix(phase: &str) -> String {
        format!("checkpoint_{phase}_")
    }

    /// Remove older checkpoint files for the phase once a newer one is
    /// durably written. Commits happen per applied batch, so without
    /// pruning the directory grows without bound. Failures here are logged
    /// and ignored; stale files only cost disk, never correctness.
    fn prune_superseded(&self, phase: &str, keep: &std::path::Path) {
        let prefix = Self::file_prefix(phase);
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Failed to scan checkpoint dir for pruning: {e}");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) || !name.ends_with(".json") || entry.path() == keep {
                continue;
            }
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!("Failed to prune checkpoint file {name}: {e}");
            }
        }
    }
}

#[async_trait]
impl CheckpointStore for FilesystemStore {
    async fn store_checkpoint(&self, id: &CheckpointID, checkpoint_data: String) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let now = Utc::now();
        let stored = StoredCheckpoint {
            checkpoint_data,
            source_type: id.source_type.clone(),
            phase: id.phase.clone(),
            created_at: now,
        };

        // Nanosecond timestamps keep rapid consecutive commits from
        // colliding on a file name.
        let filename = self.dir.join(format!(
            "checkpoint_{}_{}.json",
            id.phase,
            now.format("%Y-%m-%dT%H:%M:%S%.9f%z")
        ));

        std::fs::write(&filename, serde_json::to_string_pretty(&stored)?)?;
        tracing::debug!("Stored checkpoint to {}", filename.display());

        self.prune_superseded(&id.phase, &filename);
        Ok(())
    }

    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>> {
        if !self.dir.exists() {
            return Ok(None);
        }

        let prefix = Self::file_prefix(&id.phase);
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            let newer = match &newest {
                Some((best, _)) => modified > *best,
                None => true,
            };
            if newer {
                newest = Some((modified, entry.path()));
            }
        }

        match newest {
            Some((_, path)) => {
                let content = std::fs::read_to_string(path)?;
                Ok(Some(serde_json::from_str(&content)?))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id() -> CheckpointID {
        CheckpointID {
            source_type: "test".to_string(),
            phase: "committed".to_string(),
        }
    }

    #[tokio::test]
    async fn test_store_then_read() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemStore::new(tmp.path());

        store
            .store_checkpoint(&id(), r#"{"offset":1}"#.to_string())
            .await
            .unwrap();

        let loaded = store.read_checkpoint(&id()).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint_data, r#"{"offset":1}"#);
        assert_eq!(loaded.source_type, "test");
        assert_eq!(loaded.phase, "committed");
    }

    #[tokio::test]
    async fn test_read_missing_slot_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemStore::new(tmp.path().join("never-created"));
        assert!(store.read_checkpoint(&id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_emission_wins() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemStore::new(tmp.path());

        store
            .store_checkpoint(&id(), r#"{"offset":1}"#.to_string())
            .await
            .unwrap();
        // Distinct mtime so the newer file is unambiguous.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store
            .store_checkpoint(&id(), r#"{"offset":2}"#.to_string())
            .await
            .unwrap();

        let loaded = store.read_checkpoint(&id()).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint_data, r#"{"offset":2}"#);
    }

    #[tokio::test]
    async fn test_superseded_files_are_pruned() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemStore::new(tmp.path());

        for n in 0..5 {
            store
                .store_checkpoint(&id(), format!(r#"{{"offset":{n}}}"#))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let files: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(files.len(), 1);

        let loaded = store.read_checkpoint(&id()).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint_data, r#"{"offset":4}"#);
    }

    #[tokio::test]
    async fn test_phases_are_independent_slots() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemStore::new(tmp.path());

        let scan = CheckpointID {
            source_type: "test".to_string(),
            phase: "full_scan_start".to_string(),
        };
        store
            .store_checkpoint(&scan, r#"{"offset":10}"#.to_string())
            .await
            .unwrap();

        assert!(store.read_checkpoint(&id()).await.unwrap().is_none());
        assert!(store.read_checkpoint(&scan).await.unwrap().is_some());
    }
}
