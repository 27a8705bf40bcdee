//! Contract between the run-lifecycle engine and concrete agents.

use std::collections::{BTreeMap, HashMap};

use futures::stream::BoxStream;
use protocol_core::{AgentDescriptor, EventDraft, Request};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::memory::ThreadMemory;

/// Answers supplied by a `resume_with_input` request.
pub type InputValues = HashMap<String, serde_json::Value>;

/// How an adapter ended its run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Success,
    Error(String),
    /// The agent gave up because of cancellation it observed itself, such as
    /// a nested run that was canceled.
    Canceled,
}

/// One item of an adapter's output sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStep {
    Emit(EventDraft),
    /// Pause for input. Keys map to a description of what is asked; answers
    /// arrive through [`AgentContext::next_input`].
    WaitForInput(BTreeMap<String, String>),
    /// Terminal signal. Nothing after it is read.
    Finish(AgentOutcome),
}

impl AgentStep {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Emit(EventDraft::text(content))
    }

    pub fn success() -> Self {
        Self::Finish(AgentOutcome::Success)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Finish(AgentOutcome::Error(message.into()))
    }
}

pub type AgentStream = BoxStream<'static, AgentStep>;

/// Everything an adapter gets for one run.
pub struct AgentContext {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub request: Request,
    /// Thread memory, exclusively owned by this run while it is active.
    pub memory: ThreadMemory,
    pub cancel: CancellationToken,
    input: mpsc::Receiver<InputValues>,
}

impl AgentContext {
    pub fn new(
        run_id: Uuid,
        thread_id: Uuid,
        request: Request,
        memory: ThreadMemory,
        cancel: CancellationToken,
        input: mpsc::Receiver<InputValues>,
    ) -> Self {
        Self {
            run_id,
            thread_id,
            request,
            memory,
            cancel,
            input,
        }
    }

    /// Wait for the answers to a pending `WaitForInput`.
    ///
    /// Returns `None` once the run is canceled.
    pub async fn next_input(&mut self) -> Option<InputValues> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            values = self.input.recv() => values,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sleep unless canceled first. Returns `false` on cancellation.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// A concrete agent driven by the engine.
///
/// `start` returns a lazy sequence that should end with exactly one
/// [`AgentStep::Finish`]. The engine appends the `run_started` and
/// `run_completed` events itself; adapters must not emit them.
pub trait AgentAdapter: Send + Sync {
    fn describe(&self) -> AgentDescriptor;

    fn start(&self, ctx: AgentContext) -> AgentStream;
}
