//! Thread ownership and the one-active-run-per-thread rule.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use protocol_core::{ProtocolError, Request, RequestKind, Result, Run, Thread};
use tracing::{debug, info};
use uuid::Uuid;

use crate::memory::ThreadMemory;
use crate::run::RunHandle;

struct ThreadEntry {
    thread: Thread,
    memory: ThreadMemory,
    active: Option<Arc<RunHandle>>,
}

impl ThreadEntry {
    fn busy_with(&self) -> Option<&Arc<RunHandle>> {
        self.active.as_ref().filter(|handle| !handle.is_terminal())
    }

    fn snapshot(&self) -> Thread {
        let mut thread = self.thread.clone();
        thread.active_run_id = self.busy_with().map(|handle| handle.id());
        thread
    }
}

#[derive(Default)]
struct SchedulerState {
    threads: HashMap<Uuid, ThreadEntry>,
    runs: HashMap<Uuid, Arc<RunHandle>>,
}

/// Where the scheduler sent a request.
#[derive(Debug, Clone)]
pub enum Routed {
    /// A new run was admitted and now holds its thread's active slot.
    Started(Arc<RunHandle>),
    /// Cancel or resume addressed to an existing run.
    Existing(Arc<RunHandle>),
}

impl Routed {
    /// The run the request was routed to.
    pub fn handle(&self) -> &Arc<RunHandle> {
        match self {
            Self::Started(handle) | Self::Existing(handle) => handle,
        }
    }
}

/// Owns every thread of one agent and its memory.
///
/// All reads and writes of a thread's active-run pointer happen under this
/// scheduler's lock, so admission of new runs is linearizable.
pub struct ThreadScheduler {
    agent: String,
    state: Mutex<SchedulerState>,
}

impl ThreadScheduler {
    /// Empty scheduler for the agent named `agent`.
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Agent whose threads this scheduler owns.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Create an empty thread with fresh memory.
    pub fn create_thread(&self) -> Thread {
        let mut state = self.lock();
        Self::insert_thread(&mut state, &self.agent)
    }

    fn insert_thread(state: &mut SchedulerState, agent: &str) -> Thread {
        let thread = Thread::new(agent);
        state.threads.insert(
            thread.id,
            ThreadEntry {
                thread: thread.clone(),
                memory: ThreadMemory::new(),
                active: None,
            },
        );
        debug!(thread_id = %thread.id, agent, "Thread created");
        thread
    }

    /// Look up a thread, or create one when no id is given.
    pub fn resolve_or_create(&self, thread_id: Option<Uuid>) -> Result<Thread> {
        let mut state = self.lock();
        match thread_id {
            Some(id) => state
                .threads
                .get(&id)
                .map(ThreadEntry::snapshot)
                .ok_or(ProtocolError::UnknownThread(id)),
            None => Ok(Self::insert_thread(&mut state, &self.agent)),
        }
    }

    /// Admit a request.
    ///
    /// New-run requests get a fresh run, built by `open` while the lock is
    /// held, unless the thread already has a live run. Cancel and resume
    /// requests are routed to the run they target.
    pub fn begin_run<F>(&self, request: &Request, open: F) -> Result<Routed>
    where
        F: FnOnce(Run, ThreadMemory) -> Result<Arc<RunHandle>>,
    {
        let mut state = self.lock();

        if request.kind() != RequestKind::NewRun {
            return Self::route_existing(&state, request).map(Routed::Existing);
        }

        let thread_id = match request.thread_id {
            Some(id) if state.threads.contains_key(&id) => id,
            Some(id) => return Err(ProtocolError::UnknownThread(id)),
            None => Self::insert_thread(&mut state, &self.agent).id,
        };

        let SchedulerState { threads, runs } = &mut *state;
        let entry = threads
            .get_mut(&thread_id)
            .ok_or(ProtocolError::UnknownThread(thread_id))?;

        if let Some(active) = entry.busy_with() {
            return Err(ProtocolError::conflict(format!(
                "Thread {} already has an active run {}",
                thread_id,
                active.id()
            )));
        }

        let run = Run::new(thread_id, self.agent.clone(), request.request_id.clone());
        let run_id = run.id;
        let handle = open(run, entry.memory.clone())?;

        entry.active = Some(Arc::clone(&handle));
        entry.thread.run_ids.push(run_id);
        runs.insert(run_id, Arc::clone(&handle));

        info!(thread_id = %thread_id, run_id = %run_id, request = request.type_name(), "Run admitted");
        Ok(Routed::Started(handle))
    }

    fn route_existing(state: &SchedulerState, request: &Request) -> Result<Arc<RunHandle>> {
        if let Some(run_id) = request.run_id {
            let handle = state
                .runs
                .get(&run_id)
                .ok_or(ProtocolError::UnknownRun(run_id))?;
            if let Some(thread_id) = request.thread_id {
                if handle.thread_id() != thread_id {
                    return Err(ProtocolError::validation(format!(
                        "Run {} does not belong to thread {}",
                        run_id, thread_id
                    )));
                }
            }
            return Ok(Arc::clone(handle));
        }

        let thread_id = request
            .thread_id
            .ok_or_else(|| ProtocolError::validation("run_id or thread_id is required"))?;
        let entry = state
            .threads
            .get(&thread_id)
            .ok_or(ProtocolError::UnknownThread(thread_id))?;

        match (request.kind(), &entry.active) {
            (_, Some(handle)) if !handle.is_terminal() => Ok(Arc::clone(handle)),
            // Canceling a finished run is benign whether or not its slot was
            // released yet, so it goes to the thread's latest run.
            (RequestKind::Cancel, _) => entry
                .thread
                .run_ids
                .last()
                .and_then(|run_id| state.runs.get(run_id))
                .cloned()
                .ok_or_else(|| {
                    ProtocolError::conflict(format!("Thread {} has no run to cancel", thread_id))
                }),
            _ => Err(ProtocolError::conflict(format!(
                "Thread {} has no active run",
                thread_id
            ))),
        }
    }

    /// Free the thread's active slot if `run_id` still holds it.
    pub fn release(&self, thread_id: Uuid, run_id: Uuid) {
        let mut state = self.lock();
        if let Some(entry) = state.threads.get_mut(&thread_id) {
            if entry.active.as_ref().is_some_and(|h| h.id() == run_id) {
                entry.active = None;
                debug!(thread_id = %thread_id, run_id = %run_id, "Thread released");
            }
        }
    }

    /// Remove a thread with no live run, returning its memory and run ids.
    pub fn delete_thread(&self, thread_id: Uuid) -> Result<(ThreadMemory, Vec<Uuid>)> {
        let mut state = self.lock();
        let entry = state
            .threads
            .get(&thread_id)
            .ok_or(ProtocolError::UnknownThread(thread_id))?;

        if let Some(active) = entry.busy_with() {
            return Err(ProtocolError::conflict(format!(
                "Thread {} has an active run {}; cancel it first",
                thread_id,
                active.id()
            )));
        }

        let Some(entry) = state.threads.remove(&thread_id) else {
            return Err(ProtocolError::UnknownThread(thread_id));
        };
        for run_id in &entry.thread.run_ids {
            state.runs.remove(run_id);
        }

        info!(thread_id = %thread_id, runs = entry.thread.run_ids.len(), "Thread deleted");
        Ok((entry.memory, entry.thread.run_ids))
    }

    /// Snapshot of a thread.
    pub fn get_thread(&self, thread_id: Uuid) -> Option<Thread> {
        self.lock().threads.get(&thread_id).map(ThreadEntry::snapshot)
    }

    /// Threads, oldest first.
    pub fn list_threads(&self) -> Vec<Thread> {
        let mut threads: Vec<Thread> = self
            .lock()
            .threads
            .values()
            .map(ThreadEntry::snapshot)
            .collect();
        threads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        threads
    }

    /// Handle of any run still owned by one of the threads.
    pub fn run(&self, run_id: Uuid) -> Option<Arc<RunHandle>> {
        self.lock().runs.get(&run_id).cloned()
    }

    /// Runs that have not reached a terminal state.
    pub fn live_runs(&self) -> Vec<Arc<RunHandle>> {
        self.lock()
            .threads
            .values()
            .filter_map(|entry| entry.busy_with().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::CancelOutcome;
    use protocol_core::FinishReason;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn open(run: Run, _memory: ThreadMemory) -> Result<Arc<RunHandle>> {
        let (tx, _rx) = mpsc::channel(1);
        let handle = RunHandle::new(run, tx);
        handle.activate()?;
        Ok(Arc::new(handle))
    }

    #[test]
    fn test_new_run_creates_thread_implicitly() {
        let scheduler = ThreadScheduler::new("echo");
        let routed = scheduler.begin_run(&Request::chat("hi"), open).unwrap();

        let Routed::Started(handle) = routed else {
            panic!("expected a new run");
        };
        let thread = scheduler.get_thread(handle.thread_id()).unwrap();
        assert_eq!(thread.active_run_id, Some(handle.id()));
        assert_eq!(thread.run_ids, vec![handle.id()]);
    }

    #[test]
    fn test_unknown_thread_rejected() {
        let scheduler = ThreadScheduler::new("echo");
        let missing = Uuid::new_v4();

        let err = scheduler
            .begin_run(&Request::chat("hi").on_thread(missing), open)
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnknownThread(missing));
        assert!(scheduler.list_threads().is_empty());
    }

    #[test]
    fn test_busy_thread_rejects_second_run_until_finished() {
        let scheduler = ThreadScheduler::new("echo");
        let thread = scheduler.create_thread();
        let request = Request::chat("hi").on_thread(thread.id);

        let first = scheduler.begin_run(&request, open).unwrap();
        let err = scheduler.begin_run(&request, open).unwrap_err();
        assert!(err.is_conflict());

        first.handle().finish(FinishReason::Success, |_| ());
        let second = scheduler.begin_run(&request, open).unwrap();
        assert!(matches!(second, Routed::Started(_)));
        assert_eq!(scheduler.get_thread(thread.id).unwrap().run_ids.len(), 2);
    }

    #[test]
    fn test_concurrent_begin_run_admits_exactly_one() {
        let scheduler = Arc::new(ThreadScheduler::new("echo"));
        let thread = scheduler.create_thread();

        let results: Vec<bool> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    let scheduler = Arc::clone(&scheduler);
                    let request = Request::chat("hi").on_thread(thread.id);
                    scope.spawn(move || scheduler.begin_run(&request, open).is_ok())
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    }

    #[test]
    fn test_cancel_and_resume_are_routed() {
        let scheduler = ThreadScheduler::new("echo");
        let started = scheduler.begin_run(&Request::chat("hi"), open).unwrap();
        let handle = started.handle().clone();

        let by_run = scheduler.begin_run(&Request::cancel(handle.id()), open).unwrap();
        assert!(matches!(by_run, Routed::Existing(ref h) if h.id() == handle.id()));

        let mut keys = HashMap::new();
        keys.insert("k".to_string(), serde_json::json!("v"));
        let by_thread = Request::new(protocol_core::RequestBody::ResumeWithInput { request_keys: keys })
            .on_thread(handle.thread_id());
        let routed = scheduler.begin_run(&by_thread, open).unwrap();
        assert_eq!(routed.handle().id(), handle.id());

        let err = scheduler
            .begin_run(&Request::cancel(Uuid::new_v4()), open)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownRun(_)));
    }

    #[test]
    fn test_resume_on_idle_thread_conflicts() {
        let scheduler = ThreadScheduler::new("echo");
        let thread = scheduler.create_thread();
        let mut keys = HashMap::new();
        keys.insert("k".to_string(), serde_json::json!("v"));
        let request = Request::new(protocol_core::RequestBody::ResumeWithInput { request_keys: keys })
            .on_thread(thread.id);

        assert!(scheduler.begin_run(&request, open).unwrap_err().is_conflict());
    }

    #[test]
    fn test_delete_thread() {
        let scheduler = ThreadScheduler::new("echo");
        let started = scheduler.begin_run(&Request::chat("hi"), open).unwrap();
        let handle = started.handle().clone();
        let thread_id = handle.thread_id();

        assert!(scheduler.delete_thread(thread_id).unwrap_err().is_conflict());

        handle.finish(FinishReason::Success, |_| ());
        scheduler.release(thread_id, handle.id());
        let (_memory, run_ids) = scheduler.delete_thread(thread_id).unwrap();
        assert_eq!(run_ids, vec![handle.id()]);
        assert!(scheduler.get_thread(thread_id).is_none());
        assert!(scheduler.run(handle.id()).is_none());
        assert_eq!(
            scheduler.delete_thread(thread_id).unwrap_err(),
            ProtocolError::UnknownThread(thread_id)
        );
    }

    #[test]
    fn test_thread_cancel_after_release_reaches_finished_run() {
        let scheduler = ThreadScheduler::new("echo");
        let started = scheduler.begin_run(&Request::chat("hi"), open).unwrap();
        let handle = started.handle().clone();
        let thread_id = handle.thread_id();

        handle.finish(FinishReason::Success, |_| ());
        let before_release = scheduler
            .begin_run(&Request::new(protocol_core::RequestBody::Cancel).on_thread(thread_id), open)
            .unwrap();
        assert_eq!(before_release.handle().id(), handle.id());

        scheduler.release(thread_id, handle.id());
        let after_release = scheduler
            .begin_run(&Request::new(protocol_core::RequestBody::Cancel).on_thread(thread_id), open)
            .unwrap();
        assert!(matches!(after_release, Routed::Existing(ref h) if h.id() == handle.id()));
        assert_eq!(
            after_release.handle().request_cancel(),
            CancelOutcome::AlreadyFinished(FinishReason::Success)
        );
    }

    #[test]
    fn test_thread_cancel_without_runs_conflicts() {
        let scheduler = ThreadScheduler::new("echo");
        let thread = scheduler.create_thread();
        let request = Request::new(protocol_core::RequestBody::Cancel).on_thread(thread.id);

        assert!(scheduler.begin_run(&request, open).unwrap_err().is_conflict());
    }
}
