mod agent;
mod event;
mod request;
mod run;
mod thread;

pub use agent::{AgentDescriptor, AgentEntry, AgentOperation, STANDARD_ENDPOINTS};
pub use event::{Event, EventDraft, EventPayload, FinishReason, Role};
pub use request::{Request, RequestBody, RequestKind};
pub use run::{Run, RunState};
pub use thread::Thread;
