use protocol_core::Event;

use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub run_id: String,
    pub id: i64,
    pub thread_id: String,
    pub agent: String,
    pub event_type: String,
    pub data: String,
    pub created_at: i64,
}

impl EventRow {
    /// The full event is kept as JSON; the other columns exist for lookups.
    pub fn into_domain(self) -> Result<Event, DbError> {
        serde_json::from_str(&self.data).map_err(|e| DbError::CorruptEvent {
            run_id: self.run_id,
            event_id: self.id,
            reason: e.to_string(),
        })
    }
}

impl TryFrom<&Event> for EventRow {
    type Error = DbError;

    fn try_from(event: &Event) -> Result<Self, Self::Error> {
        Ok(Self {
            run_id: event.run_id.to_string(),
            id: i64::try_from(event.id).map_err(|_| DbError::CorruptEvent {
                run_id: event.run_id.to_string(),
                event_id: i64::MAX,
                reason: format!("event id {} does not fit the id column", event.id),
            })?,
            thread_id: event.thread_id.to_string(),
            agent: event.agent.clone(),
            event_type: event.type_name().to_string(),
            data: serde_json::to_string(event)?,
            created_at: event.timestamp.timestamp_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_core::EventDraft;
    use uuid::Uuid;

    #[test]
    fn test_row_roundtrip_keeps_payload() {
        let event = EventDraft::tool_result("search", "2 hits")
            .with_depth(1)
            .into_event(4, Uuid::new_v4(), Uuid::new_v4(), "delegate");

        let row = EventRow::try_from(&event).unwrap();
        assert_eq!(row.id, 4);
        assert_eq!(row.event_type, "tool_result");

        let restored = row.into_domain().unwrap();
        assert_eq!(restored, event);
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let row = EventRow {
            run_id: Uuid::nil().to_string(),
            id: 0,
            thread_id: Uuid::nil().to_string(),
            agent: "echo".to_string(),
            event_type: "text_output".to_string(),
            data: "{not json".to_string(),
            created_at: 0,
        };

        assert!(matches!(row.into_domain(), Err(DbError::CorruptEvent { .. })));
    }
}
