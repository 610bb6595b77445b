//! Pipeline phases a checkpoint can belong to.

use serde::{Deserialize, Serialize};

/// Which point of the pipeline lifecycle a checkpoint marks.
///
/// Two phases exist because the first start of a connector is special: the
/// tail position must be captured *before* the initial collection scan so
/// writes concurrent with the scan are replayed rather than lost.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    /// Captured immediately before the initial full-collection scan.
    /// Tailing resumes from here once the scan completes, replaying any
    /// writes that raced the scan; downstream idempotency absorbs the
    /// duplicates.
    FullScanStart,

    /// Advanced by the index writer each time a bulk batch is fully
    /// applied. This is the position a restarted connector resumes from.
    Committed,
}

impl SyncPhase {
    /// String form used in checkpoint file names and stored envelopes.
    pub fn as_str(&self) -> &str {
        match self {
            SyncPhase::FullScanStart => "full_scan_start",
            SyncPhase::Committed => "committed",
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_scan_start" => Ok(SyncPhase::FullScanStart),
            "committed" => Ok(SyncPhase::Committed),
            other => Err(anyhow::anyhow!("Unknown sync phase: {other}")),
        }
    }
}
