use crate::error::DbError;
use crate::models::EventRow;
use protocol_core::Event;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, event: &Event) -> Result<(), DbError> {
        let row = EventRow::try_from(event)?;

        let result = sqlx::query(
            r#"
            INSERT INTO events (run_id, id, thread_id, agent, event_type, data, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (run_id, id) DO NOTHING
            "#,
        )
        .bind(&row.run_id)
        .bind(row.id)
        .bind(&row.thread_id)
        .bind(&row.agent)
        .bind(&row.event_type)
        .bind(&row.data)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::DuplicateEvent {
                run_id: event.run_id,
                event_id: event.id,
            });
        }

        Ok(())
    }

    /// Events of a run with id greater than `since`, in id order.
    pub async fn find_by_run_id_since(
        &self,
        run_id: Uuid,
        since: Option<u64>,
    ) -> Result<Vec<Event>, DbError> {
        let since = since.map(|s| i64::try_from(s).unwrap_or(i64::MAX)).unwrap_or(-1);

        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT run_id, id, thread_id, agent, event_type, data, created_at
            FROM events
            WHERE run_id = ? AND id > ?
            ORDER BY id ASC
            "#,
        )
        .bind(run_id.to_string())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_domain).collect()
    }

    pub async fn delete_by_run_id(&self, run_id: Uuid) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM events WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use protocol_core::{EventDraft, FinishReason};

    async fn setup_test_db() -> SqlitePool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn run_events(run_id: Uuid, thread_id: Uuid) -> Vec<Event> {
        vec![
            EventDraft::run_started("req-1").into_event(0, run_id, thread_id, "echo"),
            EventDraft::text("echo: hello").into_event(1, run_id, thread_id, "echo"),
            EventDraft::completed(FinishReason::Success, None).into_event(2, run_id, thread_id, "echo"),
        ]
    }

    #[tokio::test]
    async fn test_create_and_find_since() {
        let repo = EventRepository::new(setup_test_db().await);
        let run_id = Uuid::new_v4();
        for event in run_events(run_id, Uuid::new_v4()) {
            repo.create(&event).await.unwrap();
        }

        let all = repo.find_by_run_id_since(run_id, None).await.unwrap();
        assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![0, 1, 2]);

        let tail = repo.find_by_run_id_since(run_id, Some(0)).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].type_name(), "text_output");
        assert!(tail[1].is_terminal());
    }

    #[tokio::test]
    async fn test_duplicate_event_is_rejected() {
        let repo = EventRepository::new(setup_test_db().await);
        let event = EventDraft::text("x").into_event(0, Uuid::new_v4(), Uuid::new_v4(), "echo");

        repo.create(&event).await.unwrap();
        let result = repo.create(&event).await;
        assert!(matches!(result, Err(DbError::DuplicateEvent { .. })));
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = EventRepository::new(setup_test_db().await);
        let thread_id = Uuid::new_v4();
        let run_id = Uuid::new_v4();
        for event in run_events(run_id, thread_id) {
            repo.create(&event).await.unwrap();
        }

        assert_eq!(repo.delete_by_run_id(run_id).await.unwrap(), 3);
        assert_eq!(repo.delete_by_run_id(run_id).await.unwrap(), 0);
        assert!(repo.find_by_run_id_since(run_id, None).await.unwrap().is_empty());
    }
}
