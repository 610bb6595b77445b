//! Typed save/load operations over a checkpoint store.

use crate::{Checkpoint, CheckpointID, CheckpointStore, SyncPhase};

/// Binds a storage backend to typed checkpoint operations.
///
/// # Example
///
/// ```rust,ignore
/// let store = checkpoint::FilesystemStore::new(".mongo-es-sync-checkpoints");
/// let manager = checkpoint::SyncManager::new(store);
///
/// manager.emit_checkpoint(&cp, SyncPhase::Committed).await?;
/// let resumed: Option<OplogCheckpoint> =
///     manager.read_checkpoint(SyncPhase::Committed).await?;
/// ```
pub struct SyncManager<S: CheckpointStore> {
    store: S,
}

impl<S: CheckpointStore> SyncManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    fn slot<C: Checkpoint>(phase: &SyncPhase) -> CheckpointID {
        CheckpointID {
            source_type: C::SOURCE_TYPE.to_string(),
            phase: phase.as_str().to_string(),
        }
    }

    /// Persist a checkpoint for the given phase.
    pub async fn emit_checkpoint<C: Checkpoint>(
        &self,
        checkpoint: &C,
        phase: SyncPhase,
    ) -> anyhow::Result<()> {
        let id = Self::slot::<C>(&phase);
        let data = serde_json::to_string(checkpoint)?;
        self.store.store_checkpoint(&id, data).await?;

        tracing::debug!(
            "Emitted {} checkpoint: {}",
            phase,
            checkpoint.to_cli_string()
        );
        Ok(())
    }

    /// Load the latest checkpoint for the phase, validating the source
    /// type. `None` means the slot has never been written (first start).
    pub async fn read_checkpoint<C: Checkpoint>(
        &self,
        phase: SyncPhase,
    ) -> anyhow::Result<Option<C>> {
        let id = Self::slot::<C>(&phase);
        let Some(stored) = self.store.read_checkpoint(&id).await? else {
            return Ok(None);
        };

        if stored.source_type != C::SOURCE_TYPE {
            anyhow::bail!(
                "Checkpoint type mismatch: expected '{}', found '{}'",
                C::SOURCE_TYPE,
                stored.source_type
            );
        }

        Ok(Some(serde_json::from_str(&stored.checkpoint_data)?))
    }
}
