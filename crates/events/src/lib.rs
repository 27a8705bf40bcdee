//! Event log and broker for agent runs.
//!
//! Every run owns one append-only [`EventLog`]. The [`EventBroker`] keeps the
//! logs of all live runs, serves cursor reads and streaming subscriptions from
//! them, and writes events through to an optional durable [`EventStore`].

mod broker;
mod error;
mod log;
mod store;

pub use broker::{EventBroker, RetentionPolicy};
pub use error::LogError;
pub use log::{EventLog, EventStream};
pub use store::{EventStore, MemoryEventStore};
