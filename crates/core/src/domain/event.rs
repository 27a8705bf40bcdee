use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Why a run ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Success,
    Error,
    Canceled,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }
}

/// Speaker of an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    #[default]
    Assistant,
    User,
    Tool,
}

/// Type-specific body of an event, selected by the `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// First event of every run.
    RunStarted { request_id: String },

    TextOutput { content: String },

    ToolCall {
        function_name: String,
        #[serde(default)]
        args: HashMap<String, serde_json::Value>,
    },

    ToolResult {
        function_name: String,
        text_result: String,
    },

    ArtifactGenerated {
        name: String,
        artifact_id: String,
        url: String,
        mime_type: String,
    },

    /// The run is paused until a `resume_with_input` request supplies every key.
    /// Values describe what is being asked for.
    WaitForInput { request_keys: BTreeMap<String, String> },

    /// Terminal event. Exactly one per finished run, always last.
    RunCompleted {
        finish_reason: FinishReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Extension point for agent-specific events.
    Custom {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl EventPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::TextOutput { .. } => "text_output",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::ArtifactGenerated { .. } => "artifact_generated",
            Self::WaitForInput { .. } => "wait_for_input",
            Self::RunCompleted { .. } => "run_completed",
            Self::Custom { .. } => "custom",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted { .. })
    }

    /// Lifecycle markers are appended by the run controller only.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::RunStarted { .. } | Self::RunCompleted { .. })
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self {
            Self::RunCompleted { finish_reason, .. } => Some(*finish_reason),
            _ => None,
        }
    }

    pub fn completed(finish_reason: FinishReason, error: Option<String>) -> Self {
        Self::RunCompleted {
            finish_reason,
            error,
        }
    }
}

/// An event as stored in a run's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Event {
    /// Dense per-run sequence number. The `run_started` event is 0.
    pub id: u64,
    pub run_id: Uuid,
    pub thread_id: Uuid,
    /// Name of the agent that produced the event.
    pub agent: String,
    pub role: Role,
    /// Caller-chain nesting; 0 for the agent addressed by the request.
    #[serde(default)]
    pub depth: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }

    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }
}

/// An event before the log has assigned its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub role: Role,
    pub depth: u32,
    pub payload: EventPayload,
}

impl EventDraft {
    pub fn new(role: Role, payload: EventPayload) -> Self {
        Self {
            role,
            depth: 0,
            payload,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            EventPayload::TextOutput {
                content: content.into(),
            },
        )
    }

    pub fn tool_call(
        function_name: impl Into<String>,
        args: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self::new(
            Role::Assistant,
            EventPayload::ToolCall {
                function_name: function_name.into(),
                args,
            },
        )
    }

    pub fn tool_result(function_name: impl Into<String>, text_result: impl Into<String>) -> Self {
        Self::new(
            Role::Tool,
            EventPayload::ToolResult {
                function_name: function_name.into(),
                text_result: text_result.into(),
            },
        )
    }

    pub fn artifact(
        name: impl Into<String>,
        artifact_id: impl Into<String>,
        url: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self::new(
            Role::Assistant,
            EventPayload::ArtifactGenerated {
                name: name.into(),
                artifact_id: artifact_id.into(),
                url: url.into(),
                mime_type: mime_type.into(),
            },
        )
    }

    pub fn custom(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(
            Role::Assistant,
            EventPayload::Custom {
                name: name.into(),
                data,
            },
        )
    }

    pub(crate) fn system(payload: EventPayload) -> Self {
        Self::new(Role::System, payload)
    }

    pub fn run_started(request_id: impl Into<String>) -> Self {
        Self::system(EventPayload::RunStarted {
            request_id: request_id.into(),
        })
    }

    pub fn wait_for_input(request_keys: BTreeMap<String, String>) -> Self {
        Self::system(EventPayload::WaitForInput { request_keys })
    }

    pub fn completed(finish_reason: FinishReason, error: Option<String>) -> Self {
        Self::system(EventPayload::completed(finish_reason, error))
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Stamp the draft with its position in a run's log.
    pub fn into_event(self, id: u64, run_id: Uuid, thread_id: Uuid, agent: &str) -> Event {
        Event {
            id,
            run_id,
            thread_id,
            agent: agent.to_string(),
            role: self.role,
            depth: self.depth,
            timestamp: Utc::now(),
            payload: self.payload,
        }
    }
}

impl From<Event> for EventDraft {
    fn from(event: Event) -> Self {
        Self {
            role: event.role,
            depth: event.depth,
            payload: event.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(payload: EventPayload) -> Event {
        EventDraft::new(Role::Assistant, payload).into_event(
            3,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "echo",
        )
    }

    #[test]
    fn test_event_serialization_flattens_payload() {
        let event = sample_event(EventPayload::TextOutput {
            content: "hello".to_string(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "text_output");
        assert_eq!(json["content"], "hello");
        assert_eq!(json["id"], 3);
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["depth"], 0);
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{
            "id": 1,
            "run_id": "550e8400-e29b-41d4-a716-446655440000",
            "thread_id": "550e8400-e29b-41d4-a716-446655440001",
            "agent": "echo",
            "role": "system",
            "depth": 2,
            "timestamp": "2024-01-01T00:00:00Z",
            "type": "run_completed",
            "finish_reason": "canceled"
        }"#;
        let event: Event = serde_json::from_str(json).unwrap();

        assert_eq!(event.depth, 2);
        assert!(event.is_terminal());
        assert_eq!(event.payload.finish_reason(), Some(FinishReason::Canceled));
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let json = r#"{"type": "telepathy", "content": "x"}"#;
        assert!(serde_json::from_str::<EventPayload>(json).is_err());
    }

    #[test]
    fn test_lifecycle_classification() {
        assert!(EventPayload::RunStarted {
            request_id: "r".to_string()
        }
        .is_lifecycle());
        assert!(EventPayload::completed(FinishReason::Success, None).is_terminal());
        assert!(!EventPayload::TextOutput {
            content: String::new()
        }
        .is_lifecycle());
    }

    #[test]
    fn test_completed_omits_missing_error() {
        let json = serde_json::to_string(&EventPayload::completed(FinishReason::Success, None)).unwrap();
        assert!(!json.contains("error"));
        assert!(json.contains("\"finish_reason\":\"success\""));
    }

    #[test]
    fn test_draft_builders() {
        let draft = EventDraft::tool_result("search", "3 hits").with_depth(1);
        assert_eq!(draft.role, Role::Tool);
        assert_eq!(draft.depth, 1);
        assert_eq!(draft.payload.type_name(), "tool_result");

        let custom = EventDraft::custom("progress", serde_json::json!({"pct": 50}));
        assert_eq!(custom.payload.type_name(), "custom");
    }

    #[test]
    fn test_event_back_into_draft_keeps_depth() {
        let event = sample_event(EventPayload::TextOutput {
            content: "nested".to_string(),
        });
        let draft = EventDraft::from(event).with_depth(4);
        assert_eq!(draft.depth, 4);
    }
}
