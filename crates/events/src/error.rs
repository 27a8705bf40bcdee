use protocol_core::ProtocolError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("Run not found: {0}")]
    UnknownRun(Uuid),

    #[error("Run {0} already has a log")]
    DuplicateRun(Uuid),

    #[error("Run {0} is closed; nothing may follow its terminal event")]
    RunClosed(Uuid),

    #[error("Event store error: {0}")]
    Store(String),
}

impl From<LogError> for ProtocolError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::UnknownRun(id) => ProtocolError::UnknownRun(id),
            LogError::DuplicateRun(id) => {
                ProtocolError::conflict(format!("Run {} already has a log", id))
            }
            LogError::RunClosed(id) => {
                ProtocolError::conflict(format!("Run {} has already finished", id))
            }
            LogError::Store(msg) => ProtocolError::Storage(msg),
        }
    }
}
