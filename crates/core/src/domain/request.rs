use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

const LOGGING_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Operation-specific body of a request, selected by the `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    Chat {
        input: String,
    },
    Configure {
        #[serde(default)]
        args: HashMap<String, serde_json::Value>,
    },
    /// Cancel the targeted run.
    Cancel,
    /// Answer a pending `wait_for_input` event.
    ResumeWithInput {
        request_keys: HashMap<String, serde_json::Value>,
    },
    /// Extension point for agent-specific operations.
    Custom {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

/// How the scheduler routes a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Starts a new run on the thread.
    NewRun,
    /// Addressed to an existing run's controller.
    Cancel,
    Resume,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Request {
    #[serde(default = "generate_request_id")]
    pub request_id: String,
    /// Thread to run on. Absent for new runs means "start a new thread".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Uuid>,
    /// Run targeted by cancel and resume requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging_level: Option<String>,
    #[serde(default)]
    pub request_metadata: HashMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub body: RequestBody,
}

impl Request {
    pub fn new(body: RequestBody) -> Self {
        Self {
            request_id: generate_request_id(),
            thread_id: None,
            run_id: None,
            logging_level: None,
            request_metadata: HashMap::new(),
            body,
        }
    }

    pub fn chat(input: impl Into<String>) -> Self {
        Self::new(RequestBody::Chat {
            input: input.into(),
        })
    }

    pub fn configure(args: HashMap<String, serde_json::Value>) -> Self {
        Self::new(RequestBody::Configure { args })
    }

    pub fn cancel(run_id: Uuid) -> Self {
        Self::new(RequestBody::Cancel).for_run(run_id)
    }

    pub fn resume(run_id: Uuid, request_keys: HashMap<String, serde_json::Value>) -> Self {
        Self::new(RequestBody::ResumeWithInput { request_keys }).for_run(run_id)
    }

    pub fn on_thread(mut self, thread_id: Uuid) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.request_metadata.insert(key.into(), value);
        self
    }

    /// Decode a request from JSON, reporting any shape error as a validation error.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let request: Self = serde_json::from_value(value)
            .map_err(|e| ProtocolError::validation(format!("Malformed request: {}", e)))?;
        request.validate()?;
        Ok(request)
    }

    pub fn kind(&self) -> RequestKind {
        match self.body {
            RequestBody::Cancel => RequestKind::Cancel,
            RequestBody::ResumeWithInput { .. } => RequestKind::Resume,
            _ => RequestKind::NewRun,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.body {
            RequestBody::Chat { .. } => "chat",
            RequestBody::Configure { .. } => "configure",
            RequestBody::Cancel => "cancel",
            RequestBody::ResumeWithInput { .. } => "resume_with_input",
            RequestBody::Custom { .. } => "custom",
        }
    }

    /// Checks that don't need any run or thread state.
    pub fn validate(&self) -> Result<()> {
        if self.request_id.trim().is_empty() {
            return Err(ProtocolError::validation("request_id must not be empty"));
        }

        if let Some(level) = &self.logging_level {
            if !LOGGING_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
                return Err(ProtocolError::validation(format!(
                    "Unknown logging_level: {}",
                    level
                )));
            }
        }

        match &self.body {
            RequestBody::Cancel | RequestBody::ResumeWithInput { .. }
                if self.run_id.is_none() && self.thread_id.is_none() =>
            {
                Err(ProtocolError::validation(format!(
                    "{} request needs a run_id or thread_id",
                    self.type_name()
                )))
            }
            RequestBody::ResumeWithInput { request_keys } if request_keys.is_empty() => Err(
                ProtocolError::validation("resume_with_input must supply request_keys"),
            ),
            RequestBody::Custom { name, .. } if name.trim().is_empty() => {
                Err(ProtocolError::validation("custom request needs a name"))
            }
            _ => Ok(()),
        }
    }
}
