use protocol_core::ProtocolError;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The server rejected the call with a protocol error body.
    #[error("{status} {kind}: {message}")]
    Api {
        status: u16,
        kind: String,
        message: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Event stream error: {0}")]
    EventStream(String),
}

/// Error body returned by the server on any non-2xx response.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }
}

impl From<ClientError> for ProtocolError {
    fn from(err: ClientError) -> Self {
        match &err {
            ClientError::Api { status: 400, message, .. } => {
                ProtocolError::Validation(message.clone())
            }
            ClientError::Api { status: 409, message, .. } => {
                ProtocolError::RunConflict(message.clone())
            }
            ClientError::Api { status: 404, message, .. } => {
                ProtocolError::Transport(format!("Remote resource not found: {}", message))
            }
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
