//! Change-log position token.

use serde::{Deserialize, Serialize};

/// A position in the source change log.
///
/// Maps to the oplog `ts` field: seconds since the epoch plus an ordinal
/// distinguishing operations within the same second. Positions form a total
/// order matching emission order, and the cursor never regresses one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SourcePosition {
    /// Seconds since the Unix epoch.
    pub time: u32,
    /// Ordinal of the operation within `time`.
    pub ordinal: u32,
}

impl SourcePosition {
    pub fn new(time: u32, ordinal: u32) -> Self {
        Self { time, ordinal }
    }

    /// `true` for the zero position, used when no checkpoint exists yet.
    pub fn is_zero(&self) -> bool {
        self.time == 0 && self.ordinal == 0
    }
}

impl From<bson::Timestamp> for SourcePosition {
    fn from(ts: bson::Timestamp) -> Self {
        Self {
            time: ts.time,
            ordinal: ts.increment,
        }
    }
}

impl From<SourcePosition> for bson::Timestamp {
    fn from(pos: SourcePosition) -> Self {
        bson::Timestamp {
            time: pos.time,
            increment: pos.ordinal,
        }
    }
}

impl std::fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.time, self.ordinal)
    }
}

impl std::str::FromStr for SourcePosition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (time, ordinal) = s
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("Invalid position format: expected 'time.ordinal', got '{s}'"))?;
        Ok(Self {
            time: time.parse()?,
            ordinal: ordinal.parse()?,
        })
    }
}
