use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use protocol_core::Thread;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/{agent}/threads",
    params(
        ("agent" = String, Path, description = "Agent name")
    ),
    responses(
        (status = 200, description = "Threads of the agent, oldest first", body = Vec<Thread>)
    ),
    tag = "threads"
)]
pub async fn list_threads(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> Result<Json<Vec<Thread>>, AppError> {
    let coordinator = state.agent(&agent)?;
    Ok(Json(coordinator.list_threads()))
}

#[utoipa::path(
    post,
    path = "/{agent}/threads",
    params(
        ("agent" = String, Path, description = "Agent name")
    ),
    responses(
        (status = 201, description = "Thread created", body = Thread)
    ),
    tag = "threads"
)]
pub async fn create_thread(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> Result<(StatusCode, Json<Thread>), AppError> {
    let coordinator = state.agent(&agent)?;
    let thread = coordinator.create_thread();
    tracing::info!(agent = %agent, thread_id = %thread.id, "Thread created");
    Ok((StatusCode::CREATED, Json(thread)))
}

#[utoipa::path(
    delete,
    path = "/{agent}/threads/{thread_id}",
    params(
        ("agent" = String, Path, description = "Agent name"),
        ("thread_id" = Uuid, Path, description = "Thread ID")
    ),
    responses(
        (status = 204, description = "Thread deleted"),
        (status = 404, description = "Thread not found"),
        (status = 409, description = "Thread has an active run")
    ),
    tag = "threads"
)]
pub async fn delete_thread(
    State(state): State<AppState>,
    Path((agent, thread_id)): Path<(String, Uuid)>,
) -> Result<StatusCode, AppError> {
    let coordinator = state.agent(&agent)?;
    coordinator.delete_thread(thread_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
