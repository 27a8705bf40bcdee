mod agents;
mod health;
pub mod sse;
mod threads;

pub use agents::*;
pub use health::*;
pub use sse::{get_events, stream_request, thread_history};
pub use threads::*;
