//! Append-only event log of a single run.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use futures::stream::{self, BoxStream, StreamExt};
use protocol_core::{Event, EventDraft};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::LogError;

/// Ordered events of one run, ending after its terminal event.
pub type EventStream = BoxStream<'static, Event>;

struct LogInner {
    events: Vec<Event>,
    closed_at: Option<Instant>,
}

/// Per-run ordered sequence of events with dense ids starting at 0.
///
/// The log has a single writer (the run's controller) and any number of
/// readers. Readers never block the writer: appends take a short write lock
/// and then bump a watch channel that wakes every caught-up subscriber.
pub struct EventLog {
    run_id: Uuid,
    thread_id: Uuid,
    agent: String,
    inner: RwLock<LogInner>,
    appended: watch::Sender<usize>,
    persist_failed: AtomicBool,
    durable: AtomicBool,
}

impl EventLog {
    pub fn new(run_id: Uuid, thread_id: Uuid, agent: impl Into<String>) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            run_id,
            thread_id,
            agent: agent.into(),
            inner: RwLock::new(LogInner {
                events: Vec::with_capacity(16),
                closed_at: None,
            }),
            appended,
            persist_failed: AtomicBool::new(false),
            durable: AtomicBool::new(false),
        }
    }

    /// Run this log belongs to.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Thread of the run.
    pub fn thread_id(&self) -> Uuid {
        self.thread_id
    }

    /// Name of the agent that produced the run.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Assign the next id to `draft` and store it.
    ///
    /// Fails once the terminal event has been appended.
    pub fn append(&self, draft: EventDraft) -> Result<Event, LogError> {
        let (event, len) = {
            let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
            if inner.closed_at.is_some() {
                return Err(LogError::RunClosed(self.run_id));
            }

            let id = inner.events.len() as u64;
            let event = draft.into_event(id, self.run_id, self.thread_id, &self.agent);
            if event.is_terminal() {
                inner.closed_at = Some(Instant::now());
            }
            inner.events.push(event.clone());
            (event, inner.events.len())
        };

        self.appended.send_replace(len);
        Ok(event)
    }

    /// Events with id greater than `since`, or all events when `since` is `None`.
    pub fn read(&self, since: Option<u64>) -> Vec<Event> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let start = since.map(|id| id.saturating_add(1)).unwrap_or(0);
        let start = usize::try_from(start).unwrap_or(usize::MAX);
        inner.events.get(start..).map(<[Event]>::to_vec).unwrap_or_default()
    }

    /// Number of events appended so far.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).events.len()
    }

    /// True before `run_started` is appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the newest event, if any.
    pub fn last_id(&self) -> Option<u64> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .events
            .last()
            .map(|e| e.id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at().is_some()
    }

    /// When the terminal event was appended.
    pub fn closed_at(&self) -> Option<Instant> {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).closed_at
    }

    pub fn terminal_event(&self) -> Option<Event> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.events.last().filter(|e| e.is_terminal()).cloned()
    }

    pub(crate) fn mark_persist_failed(&self) {
        self.persist_failed.store(true, Ordering::Relaxed);
    }

    /// Whether some event of this run never reached the durable store.
    pub fn persist_failed(&self) -> bool {
        self.persist_failed.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_durable(&self) {
        self.durable.store(true, Ordering::Release);
    }

    /// Whether every event through the terminal one is in the durable store.
    pub fn is_durable(&self) -> bool {
        self.durable.load(Ordering::Acquire) && !self.persist_failed()
    }

    /// Stream every event after `since`, suspending while caught up.
    ///
    /// The stream ends right after yielding the terminal event. Subscribers
    /// read from the log itself, so a slow subscriber never loses events.
    pub fn subscribe(self: &Arc<Self>, since: Option<u64>) -> EventStream {
        let state = Subscription {
            log: Arc::clone(self),
            rx: self.appended.subscribe(),
            cursor: since,
            pending: VecDeque::new(),
            finished: false,
        };

        stream::unfold(state, |mut sub| async move {
            loop {
                if let Some(event) = sub.pending.pop_front() {
                    sub.cursor = Some(event.id);
                    if event.is_terminal() {
                        sub.finished = true;
                        sub.pending.clear();
                    }
                    return Some((event, sub));
                }

                if sub.finished {
                    return None;
                }

                // Mark the current version seen before reading, so an append
                // racing with the read still wakes `changed()` below.
                sub.rx.borrow_and_update();
                let batch = sub.log.read(sub.cursor);
                if !batch.is_empty() {
                    sub.pending.extend(batch);
                    continue;
                }

                if sub.log.is_closed() {
                    return None;
                }

                if sub.rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .boxed()
    }
}

struct Subscription {
    log: Arc<EventLog>,
    rx: watch::Receiver<usize>,
    cursor: Option<u64>,
    pending: VecDeque<Event>,
    finished: bool,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("run_id", &self.run_id)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_core::{EventPayload, FinishReason};
    use tokio::time::{timeout, Duration};

    fn new_log() -> Arc<EventLog> {
        Arc::new(EventLog::new(Uuid::new_v4(), Uuid::new_v4(), "echo"))
    }

    fn ids(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.id).collect()
    }

    #[test]
    fn test_append_assigns_dense_ids_from_zero() {
        let log = new_log();
        let first = log.append(EventDraft::run_started("req-1")).unwrap();
        let second = log.append(EventDraft::text("hi")).unwrap();

        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);
        assert_eq!(second.run_id, log.run_id());
        assert_eq!(second.agent, "echo");
        assert_eq!(log.last_id(), Some(1));
    }

    #[test]
    fn test_read_is_exclusive_of_cursor() {
        let log = new_log();
        for i in 0..5 {
            log.append(EventDraft::text(format!("msg {}", i))).unwrap();
        }

        assert_eq!(ids(&log.read(None)), vec![0, 1, 2, 3, 4]);
        assert_eq!(ids(&log.read(Some(0))), vec![1, 2, 3, 4]);
        assert_eq!(ids(&log.read(Some(3))), vec![4]);
        assert!(log.read(Some(4)).is_empty());
        assert!(log.read(Some(u64::MAX)).is_empty());
    }

    #[test]
    fn test_read_is_idempotent_without_appends() {
        let log = new_log();
        log.append(EventDraft::run_started("r")).unwrap();
        log.append(EventDraft::text("a")).unwrap();

        assert_eq!(log.read(Some(0)), log.read(Some(0)));
    }

    #[test]
    fn test_append_after_terminal_is_rejected() {
        let log = new_log();
        log.append(EventDraft::run_started("r")).unwrap();
        log.append(EventDraft::completed(FinishReason::Success, None))
            .unwrap();

        assert!(log.is_closed());
        let err = log.append(EventDraft::text("late")).unwrap_err();
        assert_eq!(err, LogError::RunClosed(log.run_id()));
        assert_eq!(log.len(), 2);
        assert!(log.terminal_event().is_some());
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_follows_live_appends() {
        let log = new_log();
        log.append(EventDraft::run_started("r")).unwrap();

        let mut stream = log.subscribe(None);
        let first = stream.next().await.unwrap();
        assert!(matches!(first.payload, EventPayload::RunStarted { .. }));

        let writer = Arc::clone(&log);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append(EventDraft::text("live")).unwrap();
            writer
                .append(EventDraft::completed(FinishReason::Success, None))
                .unwrap();
        });

        let live = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("live event")
            .unwrap();
        assert_eq!(live.id, 1);

        let terminal = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("terminal event")
            .unwrap();
        assert!(terminal.is_terminal());

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_from_cursor_on_closed_log() {
        let log = new_log();
        log.append(EventDraft::run_started("r")).unwrap();
        log.append(EventDraft::text("a")).unwrap();
        log.append(EventDraft::completed(FinishReason::Error, Some("boom".into())))
            .unwrap();

        let events: Vec<Event> = log.subscribe(Some(0)).collect().await;
        assert_eq!(ids(&events), vec![1, 2]);

        let none: Vec<Event> = log.subscribe(Some(2)).collect().await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_slow_and_fast_subscribers_see_same_sequence() {
        let log = new_log();
        let fast = log.subscribe(None);
        let slow = log.subscribe(None);

        let writer = Arc::clone(&log);
        let producer = tokio::spawn(async move {
            writer.append(EventDraft::run_started("r")).unwrap();
            for i in 0..200 {
                writer.append(EventDraft::text(format!("{}", i))).unwrap();
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            writer
                .append(EventDraft::completed(FinishReason::Success, None))
                .unwrap();
        });

        let fast_events: Vec<Event> = timeout(Duration::from_secs(5), fast.collect())
            .await
            .expect("fast subscriber finishes");

        let slow_events: Vec<Event> = timeout(
            Duration::from_secs(5),
            slow.then(|event| async move {
                tokio::time::sleep(Duration::from_micros(50)).await;
                event
            })
            .collect(),
        )
        .await
        .expect("slow subscriber finishes");

        producer.await.unwrap();
        let expected: Vec<u64> = (0..202).collect();
        assert_eq!(ids(&fast_events), expected);
        assert_eq!(ids(&slow_events), expected);
    }
}
