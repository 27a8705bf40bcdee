use events::LogError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt event {event_id} of run {run_id}: {reason}")]
    CorruptEvent {
        run_id: String,
        event_id: i64,
        reason: String,
    },

    #[error("Event {event_id} of run {run_id} already stored")]
    DuplicateEvent { run_id: Uuid, event_id: u64 },
}

impl From<DbError> for LogError {
    fn from(err: DbError) -> Self {
        LogError::Store(err.to_string())
    }
}
