//! HTTP client for agents served over the REST + SSE transport.

pub mod client;
pub mod error;
pub mod events;

pub use client::{list_agents, ProtocolClient};
pub use error::{ClientError, Result};
pub use events::{EventReceiver, ReconnectPolicy};
