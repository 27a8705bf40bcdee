use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A named capability an agent offers, with optional JSON schemas.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct AgentOperation {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

impl AgentOperation {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: None,
            output_schema: None,
        }
    }

    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

/// Immutable description of an agent, fixed at registration.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct AgentDescriptor {
    pub name: String,
    pub purpose: String,
    pub endpoints: Vec<String>,
    pub operations: Vec<AgentOperation>,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Endpoints every agent served by this protocol exposes.
pub const STANDARD_ENDPOINTS: &[&str] = &["describe", "run", "get_events", "stream_request"];

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            purpose: purpose.into(),
            endpoints: STANDARD_ENDPOINTS.iter().map(|e| e.to_string()).collect(),
            operations: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: AgentOperation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    pub fn supports(&self, operation: &str) -> bool {
        self.operations.iter().any(|op| op.name == operation)
    }
}

/// Entry of the agent listing served at the transport root.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct AgentEntry {
    pub name: String,
    pub path: String,
}

impl AgentEntry {
    pub fn for_agent(name: impl Into<String>) -> Self {
        let name = name.into();
        let path = format!("/{}", name);
        Self { name, path }
    }
}
