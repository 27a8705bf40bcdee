use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_stream::stream;
use futures::StreamExt;
use protocol_core::{AgentDescriptor, AgentOperation, EventDraft, Request, RequestBody};
use serde_json::{json, Value};

use crate::adapter::{AgentAdapter, AgentContext, AgentStep, AgentStream};

const DEFAULT_STEP_MS: u64 = 100;

/// Per-thread state of the echo agent.
#[derive(Debug, Clone, Default)]
struct EchoMemory {
    inputs: Vec<String>,
    config: HashMap<String, Value>,
}

/// Reference agent that repeats its input.
///
/// Request metadata shapes a chat run:
/// - `ask`: list of keys to request through `wait_for_input` first
/// - `steps` / `step_ms`: emit progress text with cancellable pauses
/// - `fail`: end the run with this error message
#[derive(Debug, Clone, Default)]
pub struct EchoAgent;

impl EchoAgent {
    pub fn new() -> Self {
        Self
    }
}

fn metadata_keys(request: &Request, key: &str) -> Vec<String> {
    match request.request_metadata.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(single)) => vec![single.clone()],
        _ => Vec::new(),
    }
}

fn metadata_u64(request: &Request, key: &str) -> Option<u64> {
    request.request_metadata.get(key).and_then(Value::as_u64)
}

fn render(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

impl AgentAdapter for EchoAgent {
    fn describe(&self) -> AgentDescriptor {
        AgentDescriptor::new("echo", "Repeats chat input back, one text event per message")
            .with_operation(
                AgentOperation::new("chat", "Echo the input")
                    .with_input_schema(json!({"type": "string"}))
                    .with_output_schema(json!({"type": "string"})),
            )
            .with_operation(AgentOperation::new(
                "configure",
                "Store configuration on the thread",
            ))
            .with_operation(AgentOperation::new(
                "history",
                "Custom operation returning every input seen on the thread",
            ))
    }

    fn start(&self, mut ctx: AgentContext) -> AgentStream {
        let request = ctx.request.clone();
        stream! {
            match request.body.clone() {
                RequestBody::Chat { input } => {
                    let ask = metadata_keys(&request, "ask");
                    let mut answers = None;
                    if !ask.is_empty() {
                        let keys: BTreeMap<String, String> = ask
                            .iter()
                            .map(|key| (key.clone(), format!("Value for {}", key)))
                            .collect();
                        yield AgentStep::WaitForInput(keys);
                        match ctx.next_input().await {
                            Some(values) => answers = Some(values),
                            None => return,
                        }
                    }

                    let steps = metadata_u64(&request, "steps").unwrap_or(0);
                    let pause = Duration::from_millis(
                        metadata_u64(&request, "step_ms").unwrap_or(DEFAULT_STEP_MS),
                    );
                    for step in 1..=steps {
                        yield AgentStep::text(format!("step {}/{}", step, steps));
                        if !ctx.sleep(pause).await {
                            return;
                        }
                    }

                    if let Some(message) = request.request_metadata.get("fail") {
                        yield AgentStep::error(render(Some(message)));
                        return;
                    }

                    let remembered = input.clone();
                    ctx.memory
                        .with(move |memory: &mut EchoMemory| memory.inputs.push(remembered))
                        .await;
                    yield AgentStep::text(format!("echo: {}", input));

                    if let Some(answers) = answers {
                        for key in &ask {
                            yield AgentStep::text(format!("{}: {}", key, render(answers.get(key))));
                        }
                    }
                    yield AgentStep::success();
                }
                RequestBody::Configure { args } => {
                    let mut keys: Vec<String> = args.keys().cloned().collect();
                    keys.sort();
                    ctx.memory
                        .with(move |memory: &mut EchoMemory| memory.config.extend(args))
                        .await;
                    yield AgentStep::text(format!("configured: {}", keys.join(", ")));
                    yield AgentStep::success();
                }
                RequestBody::Custom { name, .. } if name == "history" => {
                    let memory = ctx.memory.get::<EchoMemory>().await.unwrap_or_default();
                    yield AgentStep::Emit(EventDraft::custom(
                        "history",
                        json!({ "inputs": memory.inputs, "config": memory.config }),
                    ));
                    yield AgentStep::success();
                }
                RequestBody::Custom { name, .. } => {
                    yield AgentStep::error(format!("Unsupported custom operation: {}", name));
                }
                RequestBody::Cancel | RequestBody::ResumeWithInput { .. } => {
                    yield AgentStep::error("Not a new-run request");
                }
            }
        }
        .boxed()
    }
}
