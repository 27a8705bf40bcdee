//! Run-lifecycle engine: thread scheduling, run control and agent adapters.

pub mod adapter;
pub mod agents;
pub mod controller;
pub mod coordinator;
pub mod memory;
pub mod registry;
pub mod run;
pub mod scheduler;
pub mod state_machine;

pub use adapter::{AgentAdapter, AgentContext, AgentOutcome, AgentStep, AgentStream, InputValues};
pub use agents::{register_builtin, DelegateAgent, EchoAgent, RemoteAgent};
pub use controller::{RunController, DEFAULT_CANCEL_GRACE};
pub use coordinator::{Coordinator, RunSettings, SubmitStatus, Submission};
pub use memory::ThreadMemory;
pub use registry::AgentRegistry;
pub use run::{CancelOutcome, RunHandle};
pub use scheduler::{Routed, ThreadScheduler};
pub use state_machine::RunStateMachine;
