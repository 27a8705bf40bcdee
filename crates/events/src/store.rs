use std::collections::HashMap;

use async_trait::async_trait;
use protocol_core::Event;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::LogError;

/// Durable backing for run logs.
///
/// Evicted logs are served from here, so implementations must return events
/// in id order.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: &Event) -> Result<(), LogError>;

    /// Events of `run_id` with id greater than `since`.
    async fn load(&self, run_id: Uuid, since: Option<u64>) -> Result<Vec<Event>, LogError>;

    /// Remove every event of a run, returning how many were deleted.
    async fn delete_run(&self, run_id: Uuid) -> Result<u64, LogError>;
}

/// In-process store, mostly useful for tests and single-process setups.
#[derive(Default)]
pub struct MemoryEventStore {
    runs: RwLock<HashMap<Uuid, Vec<Event>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: &Event) -> Result<(), LogError> {
        let mut runs = self.runs.write().await;
        let events = runs.entry(event.run_id).or_default();
        if events.last().is_some_and(|last| last.id >= event.id) {
            return Err(LogError::Store(format!(
                "event {} of run {} is out of order",
                event.id, event.run_id
            )));
        }
        events.push(event.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid, since: Option<u64>) -> Result<Vec<Event>, LogError> {
        let runs = self.runs.read().await;
        Ok(runs
            .get(&run_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| since.map_or(true, |s| e.id > s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<u64, LogError> {
        let removed = self.runs.write().await.remove(&run_id);
        Ok(removed.map(|events| events.len() as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_core::EventDraft;

    fn event(run_id: Uuid, id: u64) -> Event {
        EventDraft::text(format!("e{}", id)).into_event(id, run_id, Uuid::nil(), "echo")
    }

    #[tokio::test]
    async fn test_load_after_cursor() {
        let store = MemoryEventStore::new();
        let run_id = Uuid::new_v4();
        for id in 0..4 {
            store.append(&event(run_id, id)).await.unwrap();
        }

        let all = store.load(run_id, None).await.unwrap();
        assert_eq!(all.len(), 4);

        let tail = store.load(run_id, Some(1)).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 3]);

        assert!(store.load(Uuid::new_v4(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_out_of_order_append() {
        let store = MemoryEventStore::new();
        let run_id = Uuid::new_v4();
        store.append(&event(run_id, 0)).await.unwrap();
        store.append(&event(run_id, 1)).await.unwrap();

        let result = store.append(&event(run_id, 1)).await;
        assert!(matches!(result, Err(LogError::Store(_))));
    }

    #[tokio::test]
    async fn test_delete_run() {
        let store = MemoryEventStore::new();
        let run_id = Uuid::new_v4();
        store.append(&event(run_id, 0)).await.unwrap();
        store.append(&event(run_id, 1)).await.unwrap();

        assert_eq!(store.delete_run(run_id).await.unwrap(), 2);
        assert_eq!(store.delete_run(run_id).await.unwrap(), 0);
        assert_eq!(store.run_count().await, 0);
    }
}
