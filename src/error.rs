//! Error handling for the record pipeline
//!
//! Three error families exist, matching the failure modes of the system:
//!
//! - **Format errors** — malformed wire bytes. They always carry the byte
//!   offset of the offending input and fail the whole record; a decode is
//!   never partially recovered.
//! - **State-conformance errors** — a lifecycle-guarded operation was invoked
//!   from the wrong state. Always fatal to that call.
//! - **Stage errors** — raised by producer/transform/sink implementations,
//!   split into *temporary* (the run continues with the next record) and
//!   *permanent* (the stage is taken out of rotation).

use crate::stage::LifecycleState;
use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipeError {
    /// Malformed wire bytes; `offset` is the absolute position of the
    /// offending byte within the decoded input.
    #[error("format error at byte {offset}: {message}")]
    Format { offset: usize, message: String },

    /// A record cannot be represented in the requested wire form.
    #[error("cannot encode record: {0}")]
    Encode(String),

    /// A record was constructed with out-of-range metadata.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A lifecycle-guarded operation was called from the wrong state.
    #[error("'{stage}' is in state {actual} but {expected} is required")]
    State {
        stage: String,
        expected: &'static str,
        actual: LifecycleState,
    },

    /// The dispatch queue has been closed; no further records are accepted.
    #[error("dispatch queue is closed")]
    Closed,

    /// The dispatch queue cannot be reset while records remain undelivered.
    #[error("dispatch queue still holds {0} undelivered record(s)")]
    NotDrained(usize),

    /// Invalid tuning configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A stage failed; see [`StageError`] for the temporary/permanent split.
    #[error("stage failed: {0}")]
    Stage(#[from] StageError),

    /// IO error outside the codec layer.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipeError {
    /// Shorthand for a [`PipeError::Format`].
    pub fn format(offset: usize, message: impl Into<String>) -> Self {
        PipeError::Format {
            offset,
            message: message.into(),
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T, E = PipeError> = std::result::Result<T, E>;

/// An error raised by a producer, transform, or sink.
///
/// The `permanent` flag drives the orchestrator's reaction: temporary errors
/// are logged and counted while the run continues; a permanent error marks
/// the stage dead and it is no longer fed.
#[derive(Debug)]
pub struct StageError {
    message: String,
    permanent: bool,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl StageError {
    /// An error affecting only the current record.
    pub fn temporary(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
            source: None,
        }
    }

    /// An error that makes the stage permanently unusable.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
            source: None,
        }
    }

    /// Attach an underlying cause.
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Whether the stage should be taken out of rotation.
    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    /// Convert a lifecycle violation into a permanent stage error.
    ///
    /// A stage driven outside its legal state cannot be trusted to recover,
    /// so guard failures at the role-trait boundary are always permanent.
    pub(crate) fn from_guard(err: PipeError) -> Self {
        Self::permanent(err.to_string())
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_display() {
        let err = PipeError::format(7, "invalid character 0x7C");
        assert_eq!(
            err.to_string(),
            "format error at byte 7: invalid character 0x7C"
        );
    }

    #[test]
    fn test_stage_error_permanence() {
        assert!(!StageError::temporary("one bad record").is_permanent());
        assert!(StageError::permanent("device gone").is_permanent());
    }

    #[test]
    fn test_stage_error_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = StageError::permanent("cannot open input").with_source(io);
        assert!(err.to_string().contains("no such file"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
