use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use protocol_core::ProtocolError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Protocol(ProtocolError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Protocol(err) => {
                let message = err.to_string();
                match err {
                    ProtocolError::Validation(_) => {
                        (StatusCode::BAD_REQUEST, "validation_error", message)
                    }
                    ProtocolError::UnknownAgent(_)
                    | ProtocolError::UnknownThread(_)
                    | ProtocolError::UnknownRun(_) => (StatusCode::NOT_FOUND, "not_found", message),
                    ProtocolError::RunConflict(_) => (StatusCode::CONFLICT, "conflict", message),
                    ProtocolError::Transport(_) => {
                        tracing::warn!("Remote agent error: {}", message);
                        (StatusCode::BAD_GATEWAY, "transport_error", message)
                    }
                    ProtocolError::Storage(_) => {
                        tracing::error!("Storage error: {}", message);
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "storage_error",
                            "Storage error occurred".to_string(),
                        )
                    }
                }
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<ProtocolError> for AppError {
    fn from(err: ProtocolError) -> Self {
        AppError::Protocol(err)
    }
}

/// Failures while turning a config file into a running server.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] db::DbError),

    #[error("Agent registration failed: {0}")]
    Agent(#[from] ProtocolError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}
