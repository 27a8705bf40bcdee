//! Entry point transports talk to, one per registered agent.

use std::sync::Arc;
use std::time::Duration;

use events::{EventBroker, EventStream};
use futures::StreamExt;
use protocol_core::{
    AgentDescriptor, Event, FinishReason, ProtocolError, Request, RequestBody, Result, Run, Thread,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{AgentAdapter, AgentContext, InputValues};
use crate::controller::{finish_run, RunController, DEFAULT_CANCEL_GRACE};
use crate::memory::ThreadMemory;
use crate::run::{CancelOutcome, RunHandle};
use crate::scheduler::{Routed, ThreadScheduler};

/// Tunables shared by every run of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    /// How long a canceled adapter may keep running before it is dropped.
    pub cancel_grace: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

/// What happened to a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// A new run was admitted and has emitted `run_started`.
    Started,
    /// A cancel or resume was accepted by a live run.
    Accepted,
    /// A cancel reached a run that had already finished.
    AlreadyFinished,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub status: SubmitStatus,
    /// Run snapshot taken right after the request was applied.
    pub run: Run,
    /// Event answering the request, when one was asked for or is at hand.
    pub event: Option<Event>,
    /// Events after this id are the ones caused by the request.
    pub cursor: Option<u64>,
}

/// Binds an agent's descriptor and adapter to its threads and event logs.
pub struct Coordinator {
    descriptor: AgentDescriptor,
    adapter: Arc<dyn AgentAdapter>,
    scheduler: Arc<ThreadScheduler>,
    broker: EventBroker,
    settings: RunSettings,
}

impl Coordinator {
    /// Coordinator for `adapter`, writing its runs to `broker`.
    pub fn new(adapter: Arc<dyn AgentAdapter>, broker: EventBroker) -> Self {
        let descriptor = adapter.describe();
        Self {
            scheduler: Arc::new(ThreadScheduler::new(descriptor.name.clone())),
            descriptor,
            adapter,
            broker,
            settings: RunSettings::default(),
        }
    }

    /// Override the default run settings.
    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Agent name, as registered.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Descriptor reported by the adapter.
    pub fn describe(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// Broker holding this agent's run logs.
    pub fn broker(&self) -> &EventBroker {
        &self.broker
    }

    /// Apply a request.
    ///
    /// New-run requests return once `run_started` is in the log; the run
    /// itself continues in the background. With `wait`, cancel returns the
    /// terminal event and resume returns the next event after the resume.
    pub async fn submit(&self, request: Request, wait: bool) -> Result<Submission> {
        request.validate()?;
        debug!(
            agent = %self.name(),
            request_id = %request.request_id,
            request = request.type_name(),
            logging_level = request.logging_level.as_deref().unwrap_or("default"),
            "Request received"
        );

        let (input_tx, input_rx) = mpsc::channel(1);
        let mut thread_memory = None;
        let routed = self.scheduler.begin_run(&request, |run, memory| {
            self.broker.open(run.id, run.thread_id, &run.agent)?;
            thread_memory = Some(memory);
            Ok(Arc::new(RunHandle::new(run, input_tx)))
        })?;

        match routed {
            Routed::Started(handle) => {
                let memory = thread_memory.unwrap_or_default();
                self.launch(handle, request, memory, input_rx).await
            }
            Routed::Existing(handle) => match request.body {
                RequestBody::Cancel => self.cancel(handle, wait).await,
                RequestBody::ResumeWithInput { request_keys } => {
                    self.resume(handle, request_keys, wait).await
                }
                _ => Err(ProtocolError::validation(format!(
                    "{} request cannot target an existing run",
                    request.type_name()
                ))),
            },
        }
    }

    async fn launch(
        &self,
        handle: Arc<RunHandle>,
        request: Request,
        memory: ThreadMemory,
        input: mpsc::Receiver<InputValues>,
    ) -> Result<Submission> {
        let run_id = handle.id();
        let thread_id = handle.thread_id();
        let controller = RunController::new(Arc::clone(&handle), self.broker.clone())
            .with_cancel_grace(self.settings.cancel_grace);

        let started = match controller.start(&request.request_id).await {
            Ok(event) => event,
            Err(e) => {
                finish_run(&handle, &self.broker, FinishReason::Error, Some(e.to_string())).await;
                self.scheduler.release(thread_id, run_id);
                return Err(e);
            }
        };

        let ctx = AgentContext::new(
            run_id,
            thread_id,
            request,
            memory,
            handle.cancel_token(),
            input,
        );
        let adapter = Arc::clone(&self.adapter);
        let task = tokio::spawn(async move {
            let stream = adapter.start(ctx);
            controller.drive(stream).await
        });

        // Supervise the run so a panicking adapter still gets its terminal
        // event and frees the thread.
        let scheduler = Arc::clone(&self.scheduler);
        let broker = self.broker.clone();
        let supervised = Arc::clone(&handle);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                let message = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    "run task was aborted".to_string()
                };
                error!(run_id = %run_id, "Agent task failed: {}", message);
                finish_run(&supervised, &broker, FinishReason::Error, Some(message)).await;
            }
            scheduler.release(thread_id, run_id);
        });

        Ok(Submission {
            status: SubmitStatus::Started,
            run: handle.snapshot(),
            event: Some(started),
            cursor: None,
        })
    }

    async fn cancel(&self, handle: Arc<RunHandle>, wait: bool) -> Result<Submission> {
        let run_id = handle.id();
        let cursor = self.last_event_id(run_id);

        match handle.request_cancel() {
            CancelOutcome::Accepted => {
                info!(run_id = %run_id, "Cancel accepted");
                let event = if wait {
                    self.wait_for_terminal(run_id).await?
                } else {
                    None
                };
                Ok(Submission {
                    status: SubmitStatus::Accepted,
                    run: handle.snapshot(),
                    event,
                    cursor,
                })
            }
            CancelOutcome::AlreadyFinished(reason) => {
                debug!(run_id = %run_id, finish_reason = reason.as_str(), "Cancel of finished run ignored");
                // The log may already be evicted; the cancel is still benign.
                let terminal = self.wait_for_terminal(run_id).await.ok().flatten();
                Ok(Submission {
                    status: SubmitStatus::AlreadyFinished,
                    run: handle.snapshot(),
                    cursor: terminal.as_ref().and_then(|e| e.id.checked_sub(1)),
                    event: terminal,
                })
            }
        }
    }

    async fn resume(
        &self,
        handle: Arc<RunHandle>,
        values: InputValues,
        wait: bool,
    ) -> Result<Submission> {
        let run_id = handle.id();
        let cursor = handle.resume(values)?;
        info!(run_id = %run_id, "Run resumed");

        let event = if wait {
            let mut stream = self.broker.subscribe(run_id, cursor).await?;
            stream.next().await
        } else {
            None
        };

        Ok(Submission {
            status: SubmitStatus::Accepted,
            run: handle.snapshot(),
            event,
            cursor,
        })
    }

    fn last_event_id(&self, run_id: Uuid) -> Option<u64> {
        self.broker.log(run_id).and_then(|log| log.last_id())
    }

    async fn wait_for_terminal(&self, run_id: Uuid) -> Result<Option<Event>> {
        let mut stream = self.broker.subscribe(run_id, None).await?;
        while let Some(event) = stream.next().await {
            if event.is_terminal() {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn ensure_run(&self, run_id: Uuid) -> Result<Arc<RunHandle>> {
        self.scheduler
            .run(run_id)
            .ok_or(ProtocolError::UnknownRun(run_id))
    }

    /// Events of a run after `since`.
    pub async fn get_events(&self, run_id: Uuid, since: Option<u64>) -> Result<Vec<Event>> {
        self.ensure_run(run_id)?;
        Ok(self.broker.read(run_id, since).await?)
    }

    /// Live stream of a run's events after `since`, ending after the terminal event.
    pub async fn stream_events(&self, run_id: Uuid, since: Option<u64>) -> Result<EventStream> {
        self.ensure_run(run_id)?;
        Ok(self.broker.subscribe(run_id, since).await?)
    }

    /// Submit a request and stream the events it causes.
    pub async fn submit_and_stream(&self, request: Request) -> Result<EventStream> {
        let submission = self.submit(request, false).await?;
        Ok(self
            .broker
            .subscribe(submission.run.id, submission.cursor)
            .await?)
    }

    /// Current snapshot of a run.
    pub fn run_status(&self, run_id: Uuid) -> Result<Run> {
        self.ensure_run(run_id).map(|handle| handle.snapshot())
    }

    /// Create an empty thread.
    pub fn create_thread(&self) -> Thread {
        self.scheduler.create_thread()
    }

    /// Snapshot of a thread, with its active run if any.
    pub fn get_thread(&self, thread_id: Uuid) -> Result<Thread> {
        self.scheduler
            .get_thread(thread_id)
            .ok_or(ProtocolError::UnknownThread(thread_id))
    }

    /// Threads of this agent, oldest first.
    pub fn list_threads(&self) -> Vec<Thread> {
        self.scheduler.list_threads()
    }

    /// Delete an idle thread together with its memory and event logs.
    pub async fn delete_thread(&self, thread_id: Uuid) -> Result<()> {
        let (memory, run_ids) = self.scheduler.delete_thread(thread_id)?;
        memory.clear().await;
        self.broker.remove_runs(&run_ids).await?;
        Ok(())
    }

    /// Every event of a thread, oldest run first.
    pub async fn thread_history(&self, thread_id: Uuid) -> Result<Vec<Event>> {
        let thread = self.get_thread(thread_id)?;
        Ok(self.broker.thread_history(&thread.run_ids).await?)
    }

    /// Cancel every live run and wait for their terminal events.
    pub async fn shutdown(&self) {
        let live = self.scheduler.live_runs();
        if live.is_empty() {
            return;
        }

        info!(agent = %self.name(), runs = live.len(), "Canceling live runs");
        for handle in &live {
            handle.request_cancel();
        }

        let deadline = self.settings.cancel_grace + Duration::from_secs(1);
        for handle in live {
            let run_id = handle.id();
            if tokio::time::timeout(deadline, self.wait_for_terminal(run_id))
                .await
                .is_err()
            {
                warn!(run_id = %run_id, "Run did not finish during shutdown");
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("agent panicked: {}", detail)
}
