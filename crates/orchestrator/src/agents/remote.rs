use std::sync::Arc;

use async_stream::stream;
use client::ProtocolClient;
use futures::StreamExt;
use protocol_core::{AgentDescriptor, EventDraft, EventPayload, FinishReason, ProtocolError, Request, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{AgentAdapter, AgentContext, AgentOutcome, AgentStep, AgentStream};

#[derive(Debug, Clone, Default)]
struct RemoteMemory {
    remote_thread: Option<Uuid>,
}

/// Agent served by another process, reached over the REST + SSE transport.
pub struct RemoteAgent {
    descriptor: AgentDescriptor,
    client: Arc<ProtocolClient>,
}

impl RemoteAgent {
    pub fn new(name: impl Into<String>, client: ProtocolClient, remote: AgentDescriptor) -> Self {
        let mut descriptor = remote;
        let remote_name = std::mem::replace(&mut descriptor.name, name.into());
        descriptor.purpose = format!("{} (remote agent {})", descriptor.purpose, remote_name);
        Self {
            descriptor,
            client: Arc::new(client),
        }
    }

    /// Fetch the remote descriptor and wrap the agent under a local name.
    pub async fn connect(name: impl Into<String>, base_url: &str) -> Result<Self> {
        let client = ProtocolClient::new(base_url);
        let remote = client.describe().await.map_err(|e| {
            ProtocolError::Transport(format!("Cannot describe agent at {}: {}", base_url, e))
        })?;
        info!(url = %base_url, remote = %remote.name, "Connected to remote agent");
        Ok(Self::new(name, client, remote))
    }
}

enum Next<T> {
    Canceled,
    Item(Option<T>),
}

impl AgentAdapter for RemoteAgent {
    fn describe(&self) -> AgentDescriptor {
        self.descriptor.clone()
    }

    fn start(&self, mut ctx: AgentContext) -> AgentStream {
        let client = Arc::clone(&self.client);
        stream! {
            let remote_thread = ctx.memory.with(|m: &mut RemoteMemory| m.remote_thread).await;
            let mut request = ctx.request.clone();
            request.thread_id = remote_thread;
            request.run_id = None;

            let mut events = client.stream_request(&request);
            let mut remote_run: Option<Uuid> = None;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => Next::Canceled,
                    event = events.next_event() => Next::Item(event),
                };

                let event = match next {
                    Next::Canceled => {
                        if let Some(run_id) = remote_run {
                            if let Err(e) = client.run(&Request::cancel(run_id), true).await {
                                warn!(remote_run = %run_id, "Failed to cancel remote run: {}", e);
                            }
                        }
                        yield AgentStep::Finish(AgentOutcome::Canceled);
                        return;
                    }
                    Next::Item(None) => {
                        yield AgentStep::error("Remote event stream ended without a terminal event");
                        return;
                    }
                    Next::Item(Some(Err(e))) => {
                        yield AgentStep::error(format!("Remote agent failed: {}", e));
                        return;
                    }
                    Next::Item(Some(Ok(event))) => event,
                };

                if remote_run.is_none() {
                    remote_run = Some(event.run_id);
                    let thread_id = event.thread_id;
                    ctx.memory
                        .with(move |m: &mut RemoteMemory| m.remote_thread = Some(thread_id))
                        .await;
                    debug!(run_id = %ctx.run_id, remote_run = %event.run_id, "Remote run started");
                }

                if let EventPayload::RunCompleted { finish_reason, error } = &event.payload {
                    let outcome = match finish_reason {
                        FinishReason::Success => AgentOutcome::Success,
                        FinishReason::Canceled => AgentOutcome::Canceled,
                        FinishReason::Error => AgentOutcome::Error(
                            error.clone().unwrap_or_else(|| "remote agent failed".to_string()),
                        ),
                    };
                    yield AgentStep::Finish(outcome);
                    return;
                }

                if let EventPayload::WaitForInput { request_keys } = &event.payload {
                    yield AgentStep::WaitForInput(request_keys.clone());
                    let Some(values) = ctx.next_input().await else {
                        continue;
                    };
                    if let Err(e) = client.run(&Request::resume(event.run_id, values), false).await {
                        yield AgentStep::error(format!("Remote agent refused the input: {}", e));
                        return;
                    }
                    continue;
                }

                if event.payload.is_lifecycle() {
                    continue;
                }

                let depth = event.depth + 1;
                yield AgentStep::Emit(EventDraft::from(event).with_depth(depth));
            }
        }
        .boxed()
    }
}
