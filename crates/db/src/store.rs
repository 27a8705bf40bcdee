use async_trait::async_trait;
use events::{EventStore, LogError};
use protocol_core::Event;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::repositories::EventRepository;

/// [`EventStore`] backed by the `events` table.
#[derive(Clone)]
pub struct SqliteEventStore {
    repository: EventRepository,
}

impl SqliteEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            repository: EventRepository::new(pool),
        }
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(&self, event: &Event) -> Result<(), LogError> {
        self.repository.create(event).await.map_err(LogError::from)
    }

    async fn load(&self, run_id: Uuid, since: Option<u64>) -> Result<Vec<Event>, LogError> {
        self.repository
            .find_by_run_id_since(run_id, since)
            .await
            .map_err(LogError::from)
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<u64, LogError> {
        self.repository
            .delete_by_run_id(run_id)
            .await
            .map_err(LogError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect;
    use events::{EventBroker, RetentionPolicy};
    use protocol_core::{EventDraft, FinishReason};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_broker_reads_evicted_run_from_sqlite() {
        let pool = connect("sqlite::memory:").await.unwrap();
        let store = Arc::new(SqliteEventStore::new(pool));
        let broker = EventBroker::new()
            .with_store(store.clone())
            .with_retention(RetentionPolicy::evict_after(Duration::ZERO));

        let run_id = Uuid::new_v4();
        broker.open(run_id, Uuid::new_v4(), "echo").unwrap();
        broker.append(run_id, EventDraft::run_started("r")).await.unwrap();
        broker.append(run_id, EventDraft::text("stored")).await.unwrap();
        broker
            .append(run_id, EventDraft::completed(FinishReason::Success, None))
            .await
            .unwrap();

        assert_eq!(broker.evict_expired(Instant::now()), 1);

        let events = broker.read(run_id, Some(0)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());

        broker.remove_runs(&[run_id]).await.unwrap();
        assert!(store.load(run_id, None).await.unwrap().is_empty());
    }
}
