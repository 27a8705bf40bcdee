//! Drives one run from `run_started` to its terminal event.

use std::sync::Arc;
use std::time::Duration;

use events::EventBroker;
use futures::StreamExt;
use protocol_core::{Event, EventDraft, FinishReason, Result};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{AgentOutcome, AgentStep, AgentStream};
use crate::run::RunHandle;

/// Default wait for a canceled adapter to wind down.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// How the adapter's sequence ended, before cancellation is applied.
enum Ending {
    Finished(FinishReason, Option<String>),
    Canceled,
}

/// The single writer of a run's event log.
pub struct RunController {
    handle: Arc<RunHandle>,
    broker: EventBroker,
    cancel_grace: Duration,
}

impl RunController {
    /// Controller for the run behind `handle`.
    pub fn new(handle: Arc<RunHandle>, broker: EventBroker) -> Self {
        Self {
            handle,
            broker,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// How long a canceled adapter may keep running.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Id of the driven run.
    pub fn run_id(&self) -> Uuid {
        self.handle.id()
    }

    /// Shared handle of the driven run.
    pub fn handle(&self) -> &Arc<RunHandle> {
        &self.handle
    }

    /// `Starting -> Active`: append `run_started`.
    pub async fn start(&self, request_id: &str) -> Result<Event> {
        let event = self
            .broker
            .append(self.run_id(), EventDraft::run_started(request_id))
            .await?;
        self.handle.activate()?;

        info!(run_id = %self.run_id(), thread_id = %self.handle.thread_id(), "Run started");
        Ok(event)
    }

    /// Consume the adapter's sequence until it finishes, fails, or the run is
    /// canceled, then append the terminal event.
    pub async fn drive(self, mut stream: AgentStream) -> FinishReason {
        let cancel = self.handle.cancel_token();

        let ending = loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ending::Canceled,
                step = stream.next() => step,
            };

            let Some(step) = step else {
                break Ending::Finished(
                    FinishReason::Error,
                    Some("agent ended its output without a terminal signal".to_string()),
                );
            };

            match step {
                AgentStep::Emit(draft) if draft.payload.is_lifecycle() => {
                    break Ending::Finished(
                        FinishReason::Error,
                        Some(format!(
                            "agent emitted reserved lifecycle event {}",
                            draft.payload.type_name()
                        )),
                    );
                }
                AgentStep::Emit(draft) => {
                    if let Err(e) = self.broker.append(self.run_id(), draft).await {
                        error!(run_id = %self.run_id(), error = %e, "Failed to append event");
                        break Ending::Finished(FinishReason::Error, Some(e.to_string()));
                    }
                }
                AgentStep::WaitForInput(keys) if keys.is_empty() => {
                    break Ending::Finished(
                        FinishReason::Error,
                        Some("agent asked for input without naming any keys".to_string()),
                    );
                }
                AgentStep::WaitForInput(keys) => {
                    let run_id = self.run_id();
                    let mut recorded = None;
                    let waiting = self.handle.wait_for_input(keys, |keys| {
                        let event = self
                            .broker
                            .record(run_id, EventDraft::wait_for_input(keys.clone()))?;
                        let id = event.id;
                        recorded = Some(event);
                        Ok(id)
                    });
                    if let Some(event) = recorded {
                        self.broker.persist(&event).await;
                    }
                    if let Err(e) = waiting {
                        break Ending::Finished(FinishReason::Error, Some(e.to_string()));
                    }
                    info!(run_id = %run_id, "Run waiting for input");
                }
                AgentStep::Finish(AgentOutcome::Success) => {
                    break Ending::Finished(FinishReason::Success, None);
                }
                AgentStep::Finish(AgentOutcome::Error(message)) => {
                    break Ending::Finished(FinishReason::Error, Some(message));
                }
                AgentStep::Finish(AgentOutcome::Canceled) => break Ending::Canceled,
            }
        };

        match ending {
            Ending::Finished(reason, error) => {
                drop(stream);
                self.finish(reason, error).await
            }
            Ending::Canceled => {
                self.wind_down(stream).await;
                self.finish(FinishReason::Canceled, None).await
            }
        }
    }

    /// Keep polling a canceled adapter for up to the grace period so it can
    /// stop cleanly. Output it produces meanwhile is still recorded.
    async fn wind_down(&self, mut stream: AgentStream) {
        let run_id = self.run_id();
        let drained = tokio::time::timeout(self.cancel_grace, async {
            while let Some(step) = stream.next().await {
                match step {
                    AgentStep::Emit(draft) if !draft.payload.is_lifecycle() => {
                        if self.broker.append(run_id, draft).await.is_err() {
                            return;
                        }
                    }
                    AgentStep::Finish(_) => return,
                    _ => {}
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                run_id = %run_id,
                grace_ms = self.cancel_grace.as_millis() as u64,
                "Agent did not stop within the cancel grace period, force-terminating"
            );
        }
    }

    async fn finish(&self, reason: FinishReason, error: Option<String>) -> FinishReason {
        finish_run(&self.handle, &self.broker, reason, error).await
    }
}

/// Append the terminal event of a run unless it already has one.
///
/// Returns the finish reason the run ended with.
pub(crate) async fn finish_run(
    handle: &RunHandle,
    broker: &EventBroker,
    reason: FinishReason,
    error: Option<String>,
) -> FinishReason {
    let run_id = handle.id();
    let finished = handle.finish(reason, |effective| {
        let error = match effective {
            FinishReason::Error => error.or_else(|| Some("agent failed".to_string())),
            _ => None,
        };
        let recorded = broker.record(run_id, EventDraft::completed(effective, error.clone()));
        (recorded, error)
    });
    let Some((effective, (recorded, error))) = finished else {
        debug!(run_id = %run_id, "Run already finished");
        return handle
            .snapshot()
            .finish_reason
            .unwrap_or(FinishReason::Canceled);
    };

    match recorded {
        Ok(event) => {
            broker.persist(&event).await;
            match effective {
                FinishReason::Error => warn!(
                    run_id = %run_id,
                    error = error.as_deref().unwrap_or_default(),
                    "Run errored"
                ),
                _ => info!(run_id = %run_id, finish_reason = effective.as_str(), "Run finished"),
            }
        }
        Err(e) => error!(run_id = %run_id, error = %e, "Failed to append terminal event"),
    }

    effective
}
