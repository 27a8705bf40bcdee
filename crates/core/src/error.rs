use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced synchronously to the caller of a protocol operation.
///
/// Failures inside a running agent are never reported through this type; they
/// become a terminal `run_completed` event with `finish_reason = error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Agent not found: {0}")]
    UnknownAgent(String),

    #[error("Thread not found: {0}")]
    UnknownThread(Uuid),

    #[error("Run not found: {0}")]
    UnknownRun(Uuid),

    #[error("Run conflict: {0}")]
    RunConflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// A remote agent could not be reached.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ProtocolError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::RunConflict(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::RunConflict(_))
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::new_v4();
        let error = ProtocolError::UnknownRun(id);
        assert!(error.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_conflict_helper() {
        let error = ProtocolError::conflict("thread busy");
        assert!(error.is_conflict());
        assert_eq!(error.to_string(), "Run conflict: thread busy");
        assert!(!ProtocolError::validation("bad").is_conflict());
    }
}
