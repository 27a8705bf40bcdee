use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use protocol_core::{Event, EventDraft};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::LogError;
use crate::log::{EventLog, EventStream};
use crate::store::EventStore;

/// How long finished runs stay in memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Evict a log this long after its terminal event. `None` keeps it until
    /// its thread is deleted.
    pub evict_after: Option<Duration>,
}

impl RetentionPolicy {
    /// Keep finished logs in memory until their thread is deleted.
    pub fn keep_forever() -> Self {
        Self { evict_after: None }
    }

    /// Evict finished logs `duration` after their terminal event.
    pub fn evict_after(duration: Duration) -> Self {
        Self {
            evict_after: Some(duration),
        }
    }
}

/// Registry of run logs with cursor reads, live subscriptions and
/// write-through persistence.
#[derive(Clone)]
pub struct EventBroker {
    logs: Arc<RwLock<HashMap<Uuid, Arc<EventLog>>>>,
    store: Option<Arc<dyn EventStore>>,
    retention: RetentionPolicy,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroker {
    /// Broker without a store that keeps every log in memory.
    pub fn new() -> Self {
        Self {
            logs: Arc::new(RwLock::new(HashMap::new())),
            store: None,
            retention: RetentionPolicy::default(),
        }
    }

    /// Write every appended event through to `store`.
    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set how long finished logs stay in memory.
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Current retention policy.
    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Create the empty log of a new run.
    pub fn open(
        &self,
        run_id: Uuid,
        thread_id: Uuid,
        agent: &str,
    ) -> Result<Arc<EventLog>, LogError> {
        let mut logs = self.logs.write().unwrap_or_else(|p| p.into_inner());
        if logs.contains_key(&run_id) {
            return Err(LogError::DuplicateRun(run_id));
        }

        let log = Arc::new(EventLog::new(run_id, thread_id, agent));
        logs.insert(run_id, Arc::clone(&log));
        tracing::debug!(run_id = %run_id, thread_id = %thread_id, "Opened event log");
        Ok(log)
    }

    /// In-memory log of a run, unless it was never opened or was evicted.
    pub fn log(&self, run_id: Uuid) -> Option<Arc<EventLog>> {
        self.logs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&run_id)
            .cloned()
    }

    /// Append to a run's log and write the event through to the store.
    ///
    /// The in-memory append is authoritative: a store failure is logged and
    /// pins the log in memory, but the event is still delivered.
    pub async fn append(&self, run_id: Uuid, draft: EventDraft) -> Result<Event, LogError> {
        let event = self.record(run_id, draft)?;
        self.persist(&event).await;
        Ok(event)
    }

    /// Append to the in-memory log only, waking subscribers.
    ///
    /// Callers that need the event visible while holding their own lock use
    /// this, then hand the event to [`persist`](Self::persist).
    pub fn record(&self, run_id: Uuid, draft: EventDraft) -> Result<Event, LogError> {
        let log = self.log(run_id).ok_or(LogError::UnknownRun(run_id))?;
        log.append(draft)
    }

    /// Write a recorded event through to the store, if there is one.
    pub async fn persist(&self, event: &Event) {
        let Some(store) = &self.store else {
            return;
        };
        let log = self.log(event.run_id);

        match store.append(event).await {
            Ok(()) if event.is_terminal() => {
                if let Some(log) = log {
                    log.mark_durable();
                }
            }
            Ok(()) => {}
            Err(e) => {
                tracing::error!(
                    run_id = %event.run_id,
                    event_id = event.id,
                    error = %e,
                    "Failed to persist event"
                );
                if let Some(log) = log {
                    log.mark_persist_failed();
                }
            }
        }
    }

    /// Events of `run_id` with id greater than `since`.
    pub async fn read(&self, run_id: Uuid, since: Option<u64>) -> Result<Vec<Event>, LogError> {
        if let Some(log) = self.log(run_id) {
            return Ok(log.read(since));
        }
        self.load_stored(run_id, since).await
    }

    /// Ordered stream of the run's events after `since`, ending after the
    /// terminal event.
    pub async fn subscribe(&self, run_id: Uuid, since: Option<u64>) -> Result<EventStream, LogError> {
        if let Some(log) = self.log(run_id) {
            return Ok(log.subscribe(since));
        }

        // Only finished runs are ever evicted, so the stored tail is complete.
        let events = self.load_stored(run_id, since).await?;
        Ok(stream::iter(events).boxed())
    }

    async fn load_stored(&self, run_id: Uuid, since: Option<u64>) -> Result<Vec<Event>, LogError> {
        let Some(store) = &self.store else {
            return Err(LogError::UnknownRun(run_id));
        };

        let events = store.load(run_id, since).await?;
        if !events.is_empty() {
            return Ok(events);
        }

        // An empty tail is fine as long as the run itself exists.
        if since.is_some() && !store.load(run_id, None).await?.is_empty() {
            return Ok(events);
        }
        Err(LogError::UnknownRun(run_id))
    }

    /// Every event of the given runs, in run order then id order.
    ///
    /// Runs that are neither in memory nor in the store are skipped.
    pub async fn thread_history(&self, run_ids: &[Uuid]) -> Result<Vec<Event>, LogError> {
        let mut history = Vec::new();
        for run_id in run_ids {
            match self.read(*run_id, None).await {
                Ok(events) => history.extend(events),
                Err(LogError::UnknownRun(_)) => {
                    tracing::debug!(run_id = %run_id, "Run has no retained events");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(history)
    }

    /// Drop the logs of the given runs from memory and from the store.
    pub async fn remove_runs(&self, run_ids: &[Uuid]) -> Result<usize, LogError> {
        let removed = {
            let mut logs = self.logs.write().unwrap_or_else(|p| p.into_inner());
            run_ids.iter().filter(|id| logs.remove(id).is_some()).count()
        };

        if let Some(store) = &self.store {
            for run_id in run_ids {
                store.delete_run(*run_id).await?;
            }
        }

        Ok(removed)
    }

    /// Evict finished logs whose retention period has passed.
    ///
    /// With a store configured, a log is only evicted once its terminal
    /// event is stored and no earlier write failed.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let Some(evict_after) = self.retention.evict_after else {
            return 0;
        };

        let has_store = self.store.is_some();
        let mut logs = self.logs.write().unwrap_or_else(|p| p.into_inner());
        let before = logs.len();
        logs.retain(|_, log| {
            let expired = log
                .closed_at()
                .is_some_and(|closed| now.saturating_duration_since(closed) >= evict_after);
            let evictable = if has_store { log.is_durable() } else { true };
            !(expired && evictable)
        });
        let evicted = before - logs.len();

        if evicted > 0 {
            tracing::debug!(evicted, remaining = logs.len(), "Evicted finished run logs");
        }
        evicted
    }

    /// Periodically evict expired logs until `shutdown` fires.
    pub fn spawn_janitor(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        broker.evict_expired(Instant::now());
                    }
                }
            }
            tracing::debug!("Event log janitor stopped");
        })
    }

    /// Number of logs held in memory.
    pub fn len(&self) -> usize {
        self.logs.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// True when no log is held in memory.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use async_trait::async_trait;
    use protocol_core::FinishReason;

    fn ids(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.id).collect()
    }

    async fn finished_run(broker: &EventBroker, thread_id: Uuid) -> Uuid {
        let run_id = Uuid::new_v4();
        broker.open(run_id, thread_id, "echo").unwrap();
        broker.append(run_id, EventDraft::run_started("r")).await.unwrap();
        broker.append(run_id, EventDraft::text("hello")).await.unwrap();
        broker
            .append(run_id, EventDraft::completed(FinishReason::Success, None))
            .await
            .unwrap();
        run_id
    }

    struct FailingStore;

    #[async_trait]
    impl EventStore for FailingStore {
        async fn append(&self, _event: &Event) -> Result<(), LogError> {
            Err(LogError::Store("disk full".to_string()))
        }

        async fn load(&self, _run_id: Uuid, _since: Option<u64>) -> Result<Vec<Event>, LogError> {
            Ok(Vec::new())
        }

        async fn delete_run(&self, _run_id: Uuid) -> Result<u64, LogError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_open_rejects_duplicate_run() {
        let broker = EventBroker::new();
        let run_id = Uuid::new_v4();
        broker.open(run_id, Uuid::new_v4(), "echo").unwrap();

        let err = broker.open(run_id, Uuid::new_v4(), "echo").unwrap_err();
        assert_eq!(err, LogError::DuplicateRun(run_id));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let broker = EventBroker::new();
        let run_id = Uuid::new_v4();

        assert_eq!(
            broker.read(run_id, None).await.unwrap_err(),
            LogError::UnknownRun(run_id)
        );
        assert!(broker.subscribe(run_id, None).await.is_err());
        assert!(broker
            .append(run_id, EventDraft::text("x"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_read_and_subscribe_agree() {
        let broker = EventBroker::new();
        let run_id = finished_run(&broker, Uuid::new_v4()).await;

        let read = broker.read(run_id, Some(0)).await.unwrap();
        let streamed: Vec<Event> = broker.subscribe(run_id, Some(0)).await.unwrap().collect().await;

        assert_eq!(ids(&read), vec![1, 2]);
        assert_eq!(read, streamed);
    }

    #[tokio::test]
    async fn test_write_through_and_store_fallback_after_eviction() {
        let store = Arc::new(MemoryEventStore::new());
        let broker = EventBroker::new()
            .with_store(store.clone())
            .with_retention(RetentionPolicy::evict_after(Duration::ZERO));
        let run_id = finished_run(&broker, Uuid::new_v4()).await;

        assert_eq!(store.load(run_id, None).await.unwrap().len(), 3);
        assert!(broker.log(run_id).unwrap().is_durable());
        assert_eq!(broker.evict_expired(Instant::now()), 1);
        assert!(broker.log(run_id).is_none());

        let tail = broker.read(run_id, Some(0)).await.unwrap();
        assert_eq!(ids(&tail), vec![1, 2]);

        let empty = broker.read(run_id, Some(2)).await.unwrap();
        assert!(empty.is_empty());

        let streamed: Vec<Event> = broker.subscribe(run_id, None).await.unwrap().collect().await;
        assert_eq!(ids(&streamed), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_active_runs_are_never_evicted() {
        let broker =
            EventBroker::new().with_retention(RetentionPolicy::evict_after(Duration::ZERO));
        let run_id = Uuid::new_v4();
        broker.open(run_id, Uuid::new_v4(), "echo").unwrap();
        broker.append(run_id, EventDraft::run_started("r")).await.unwrap();

        assert_eq!(broker.evict_expired(Instant::now()), 0);
        assert!(broker.log(run_id).is_some());
    }

    #[tokio::test]
    async fn test_keep_forever_never_evicts() {
        let broker = EventBroker::new();
        finished_run(&broker, Uuid::new_v4()).await;

        assert_eq!(broker.evict_expired(Instant::now() + Duration::from_secs(3600)), 0);
        assert_eq!(broker.len(), 1);
    }

    #[tokio::test]
    async fn test_persist_failure_pins_log_in_memory() {
        let broker = EventBroker::new()
            .with_store(Arc::new(FailingStore))
            .with_retention(RetentionPolicy::evict_after(Duration::ZERO));
        let run_id = finished_run(&broker, Uuid::new_v4()).await;

        assert!(broker.log(run_id).unwrap().persist_failed());
        assert_eq!(broker.evict_expired(Instant::now()), 0);
        assert_eq!(broker.read(run_id, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_thread_history_and_removal() {
        let store = Arc::new(MemoryEventStore::new());
        let broker = EventBroker::new().with_store(store.clone());
        let thread_id = Uuid::new_v4();
        let first = finished_run(&broker, thread_id).await;
        let second = finished_run(&broker, thread_id).await;

        let history = broker.thread_history(&[first, second]).await.unwrap();
        assert_eq!(history.len(), 6);
        assert!(history[..3].iter().all(|e| e.run_id == first));
        assert!(history[3..].iter().all(|e| e.run_id == second));

        assert_eq!(broker.remove_runs(&[first, second]).await.unwrap(), 2);
        assert!(broker.is_empty());
        assert_eq!(store.run_count().await, 0);
        assert!(broker.thread_history(&[first]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_janitor_stops_on_shutdown() {
        let broker =
            EventBroker::new().with_retention(RetentionPolicy::evict_after(Duration::ZERO));
        let run_id = finished_run(&broker, Uuid::new_v4()).await;

        let shutdown = CancellationToken::new();
        let handle = broker.spawn_janitor(Duration::from_millis(5), shutdown.clone());

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.log(run_id).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("janitor evicts finished log");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("janitor exits")
            .unwrap();
    }
}
