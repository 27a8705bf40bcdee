use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use protocol_core::{AgentDescriptor, EventDraft, EventPayload, FinishReason, Request};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapter::{AgentAdapter, AgentContext, AgentOutcome, AgentStep, AgentStream};
use crate::coordinator::Coordinator;

/// Remembers which inner thread continues an outer thread's conversation.
#[derive(Debug, Clone, Default)]
struct DelegateMemory {
    inner_thread: Option<Uuid>,
}

/// Agent that forwards every request to another in-process agent.
///
/// Inner events are re-emitted one level deeper, inner `wait_for_input`
/// pauses the outer run, and canceling the outer run cancels the inner one.
pub struct DelegateAgent {
    name: String,
    inner: Arc<Coordinator>,
}

impl DelegateAgent {
    pub fn new(name: impl Into<String>, inner: Arc<Coordinator>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

enum Next<T> {
    Canceled,
    Item(Option<T>),
}

impl AgentAdapter for DelegateAgent {
    fn describe(&self) -> AgentDescriptor {
        let inner = self.inner.describe();
        let mut descriptor = AgentDescriptor::new(
            self.name.clone(),
            format!("Delegates to {}: {}", inner.name, inner.purpose),
        )
        .with_tool(inner.name.clone());
        descriptor.operations = inner.operations.clone();
        descriptor
    }

    fn start(&self, mut ctx: AgentContext) -> AgentStream {
        let inner = Arc::clone(&self.inner);
        stream! {
            let remembered = ctx.memory.with(|m: &mut DelegateMemory| m.inner_thread).await;
            let inner_thread = remembered.filter(|id| inner.get_thread(*id).is_ok());

            let mut request = ctx.request.clone();
            request.thread_id = inner_thread;
            request.run_id = None;

            let submission = match inner.submit(request, false).await {
                Ok(submission) => submission,
                Err(e) => {
                    yield AgentStep::error(format!("{} rejected the request: {}", inner.name(), e));
                    return;
                }
            };
            let inner_run = submission.run.id;
            let inner_thread = submission.run.thread_id;
            ctx.memory
                .with(move |m: &mut DelegateMemory| m.inner_thread = Some(inner_thread))
                .await;
            debug!(run_id = %ctx.run_id, inner_run = %inner_run, "Delegated run started");

            let mut events = match inner.stream_events(inner_run, None).await {
                Ok(events) => events,
                Err(e) => {
                    yield AgentStep::error(format!("Cannot follow {} run: {}", inner.name(), e));
                    return;
                }
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => Next::Canceled,
                    event = events.next() => Next::Item(event),
                };

                let event = match next {
                    Next::Canceled => {
                        if let Err(e) = inner.submit(Request::cancel(inner_run), true).await {
                            warn!(inner_run = %inner_run, "Failed to cancel delegated run: {}", e);
                        }
                        yield AgentStep::Finish(AgentOutcome::Canceled);
                        return;
                    }
                    Next::Item(None) => {
                        yield AgentStep::error(format!("{} run ended without a terminal event", inner.name()));
                        return;
                    }
                    Next::Item(Some(event)) => event,
                };

                if let EventPayload::RunCompleted { finish_reason, error } = &event.payload {
                    let outcome = match finish_reason {
                        FinishReason::Success => AgentOutcome::Success,
                        FinishReason::Canceled => AgentOutcome::Canceled,
                        FinishReason::Error => AgentOutcome::Error(
                            error.clone().unwrap_or_else(|| format!("{} failed", inner.name())),
                        ),
                    };
                    yield AgentStep::Finish(outcome);
                    return;
                }

                if let EventPayload::WaitForInput { request_keys } = &event.payload {
                    yield AgentStep::WaitForInput(request_keys.clone());
                    let Some(values) = ctx.next_input().await else {
                        // Canceled; the next loop turn cancels the inner run.
                        continue;
                    };
                    if let Err(e) = inner.submit(Request::resume(inner_run, values), false).await {
                        yield AgentStep::error(format!("{} refused the input: {}", inner.name(), e));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::EchoAgent;
    use events::EventBroker;
    use protocol_core::Event;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    fn delegate() -> (Coordinator, Arc<Coordinator>) {
        let broker = EventBroker::new();
        let echo = Arc::new(Coordinator::new(Arc::new(EchoAgent::new()), broker.clone()));
        let outer = Coordinator::new(
            Arc::new(DelegateAgent::new("delegate", Arc::clone(&echo))),
            broker,
        );
        (outer, echo)
    }

    async fn collect(coordinator: &Coordinator, run_id: Uuid, since: Option<u64>) -> Vec<Event> {
        let stream = coordinator.stream_events(run_id, since).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_inner_events_are_nested_one_level() {
        let (outer, _echo) = delegate();
        let run_id = outer.submit(Request::chat("hi"), true).await.unwrap().run.id;

        let events = collect(&outer, run_id, None).await;
        let text = events.iter().find(|e| e.type_name() == "text_output").unwrap();
        assert_eq!(text.depth, 1);
        assert_eq!(text.run_id, run_id);
        assert_eq!(events[0].depth, 0);
        assert_eq!(events.last().unwrap().depth, 0);
        assert_eq!(events.last().unwrap().payload.finish_reason(), Some(FinishReason::Success));
    }

    #[tokio::test]
    async fn test_outer_thread_reuses_inner_thread() {
        let (outer, echo) = delegate();
        let first = outer.submit(Request::chat("one"), true).await.unwrap().run;
        collect(&outer, first.id, None).await;
        let second = outer
            .submit(Request::chat("two").on_thread(first.thread_id), true)
            .await
            .unwrap()
            .run;
        collect(&outer, second.id, None).await;

        let threads = echo.list_threads();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].run_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_inner_wait_for_input_surfaces_on_outer_run() {
        let (outer, _echo) = delegate();
        let request = Request::chat("hi").with_metadata("ask", json!(["color"]));
        let run_id = outer.submit(request, true).await.unwrap().run.id;

        let mut stream = outer.stream_events(run_id, Some(0)).await.unwrap();
        let waiting = stream.next().await.unwrap();
        assert_eq!(waiting.type_name(), "wait_for_input");
        assert_eq!(waiting.depth, 0);

        outer
            .submit(
                Request::resume(run_id, HashMap::from([("color".to_string(), json!("red"))])),
                false,
            )
            .await
            .unwrap();
        let rest: Vec<Event> = stream.collect().await;
        assert!(rest.iter().any(|e| matches!(
            &e.payload,
            EventPayload::TextOutput { content } if content == "color: red"
        )));
        assert_eq!(rest.last().unwrap().payload.finish_reason(), Some(FinishReason::Success));
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_inner_run() {
        let (outer, echo) = delegate();
        let request = Request::chat("slow")
            .with_metadata("steps", json!(100))
            .with_metadata("step_ms", json!(20));
        let run_id = outer.submit(request, true).await.unwrap().run.id;

        let mut stream = outer.stream_events(run_id, Some(0)).await.unwrap();
        stream.next().await.unwrap();

        let terminal = outer
            .submit(Request::cancel(run_id), true)
            .await
            .unwrap()
            .event
            .unwrap();
        assert_eq!(terminal.payload.finish_reason(), Some(FinishReason::Canceled));

        let inner_thread = &echo.list_threads()[0];
        let inner_run = inner_thread.run_ids[0];
        let inner_events = collect(&echo, inner_run, None).await;
        assert_eq!(
            inner_events.last().unwrap().payload.finish_reason(),
            Some(FinishReason::Canceled)
        );
    }

    #[tokio::test]
    async fn test_inner_failure_fails_outer_run() {
        let (outer, _echo) = delegate();
        let request = Request::chat("x").with_metadata("fail", json!("inner broke"));
        let run_id = outer.submit(request, true).await.unwrap().run.id;

        let events = collect(&outer, run_id, None).await;
        assert!(matches!(
            &events.last().unwrap().payload,
            EventPayload::RunCompleted { finish_reason: FinishReason::Error, error: Some(e) }
                if e == "inner broke"
        ));
    }
}
