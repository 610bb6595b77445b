//! Error taxonomy for the sync pipeline.

/// Pipeline error classified by how the connector must react.
///
/// - `Transient` - retried with bounded exponential backoff; invisible to
///   the provisioning layer unless the retry ceiling is reached.
/// - `Data` - one malformed record; logged and skipped so a single bad
///   document never stalls the stream.
/// - `Fatal` - retry ceiling exhausted or a non-retryable rejection; the
///   connector transitions to RECOVERING and, past its own ceiling, STOPPED.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("malformed source data: {message}")]
    Data { message: String },

    #[error("fatal failure: {message}")]
    Fatal { message: String },
}

impl SyncError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_predicates() {
        assert!(SyncError::transient("blip").is_transient());
        assert!(SyncError::data("bad doc").is_data());
        assert!(SyncError::fatal("no replica reachable").is_fatal());
        assert!(!SyncError::transient("blip").is_fatal());
    }

    #[test]
    fn test_display_includes_message() {
        let err = SyncError::fatal("destination rejected writes");
        assert!(err.to_string().contains("destination rejected writes"));
    }
}
