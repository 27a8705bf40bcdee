//! Domain model for the agent protocol.
//!
//! Agents, threads, runs, events and requests, plus the error taxonomy shared
//! by every layer of the run-lifecycle engine.

pub mod domain;
mod error;

pub use domain::*;
pub use error::{ProtocolError, Result};
