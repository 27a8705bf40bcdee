use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::event::FinishReason;

/// Lifecycle state of a run.
///
/// `Starting`, `Active` and `WaitingForInput` are non-terminal. The other
/// three are terminal and mutually exclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Starting,
    Active,
    WaitingForInput,
    Completed,
    Errored,
    Canceled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::WaitingForInput => "waiting_for_input",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "active" => Some(Self::Active),
            "waiting_for_input" => Some(Self::WaitingForInput),
            "completed" => Some(Self::Completed),
            "errored" => Some(Self::Errored),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Canceled)
    }

    /// Terminal state matching a finish reason.
    pub fn from_finish_reason(reason: FinishReason) -> Self {
        match reason {
            FinishReason::Success => Self::Completed,
            FinishReason::Error => Self::Errored,
            FinishReason::Canceled => Self::Canceled,
        }
    }
}

/// Snapshot of one execution instance bound to a thread.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct Run {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub agent: String,
    pub request_id: String,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(thread_id: Uuid, agent: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id,
            agent: agent.into(),
            request_id: request_id.into(),
            state: RunState::default(),
            finish_reason: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn activate(&mut self) {
        self.state = RunState::Active;
    }

    pub fn wait_for_input(&mut self) {
        self.state = RunState::WaitingForInput;
    }

    pub fn finish(&mut self, reason: FinishReason) {
        self.state = RunState::from_finish_reason(reason);
        self.finish_reason = Some(reason);
        self.finished_at = Some(Utc::now());
    }
}
