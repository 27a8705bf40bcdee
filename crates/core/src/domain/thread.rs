use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// A persistent conversation that outlives any single run.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct Thread {
    pub id: Uuid,
    pub agent: String,
    pub created_at: DateTime<Utc>,
    /// Run currently holding the thread's active slot.
    pub active_run_id: Option<Uuid>,
    /// Every run of the thread, in creation order.
    #[serde(default)]
    pub run_ids: Vec<Uuid>,
}

impl Thread {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent: agent.into(),
            created_at: Utc::now(),
            active_run_id: None,
            run_ids: Vec::new(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active_run_id.is_some()
    }
}
