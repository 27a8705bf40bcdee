use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orchestrator::{SubmitStatus, Submission};
use protocol_core::{AgentDescriptor, AgentEntry, Request, Run};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    #[serde(default)]
    pub wait: bool,
}

#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Agents served by this process", body = Vec<AgentEntry>)
    ),
    tag = "agents"
)]
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentEntry>> {
    Json(state.registry.entries())
}

#[utoipa::path(
    get,
    path = "/{agent}/describe",
    params(
        ("agent" = String, Path, description = "Agent name")
    ),
    responses(
        (status = 200, description = "Agent descriptor", body = AgentDescriptor),
        (status = 404, description = "Agent not found")
    ),
    tag = "agents"
)]
pub async fn describe_agent(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> Result<Json<AgentDescriptor>, AppError> {
    let coordinator = state.agent(&agent)?;
    Ok(Json(coordinator.describe().clone()))
}

#[utoipa::path(
    post,
    path = "/{agent}/run",
    params(
        ("agent" = String, Path, description = "Agent name"),
        ("wait" = Option<bool>, Query, description = "Return the event answering the request")
    ),
    request_body = Request,
    responses(
        (status = 200, description = "Answering event, or cancel of a finished run", body = protocol_core::Event),
        (status = 202, description = "Request accepted"),
        (status = 400, description = "Invalid request"),
        (status = 404, description = "Unknown agent, thread or run"),
        (status = 409, description = "Thread busy or run in the wrong state")
    ),
    tag = "runs"
)]
pub async fn run(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Query(query): Query<RunQuery>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, AppError> {
    let coordinator = state.agent(&agent)?;
    let request = Request::from_json(body)?;
    let submission = coordinator.submit(request, query.wait).await?;
    Ok(submission_response(submission, query.wait))
}

fn submission_response(submission: Submission, wait: bool) -> Response {
    match submission.event {
        Some(event) if wait => (StatusCode::OK, Json(event)).into_response(),
        _ if submission.status == SubmitStatus::AlreadyFinished => StatusCode::OK.into_response(),
        _ => StatusCode::ACCEPTED.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/{agent}/runs/{run_id}",
    params(
        ("agent" = String, Path, description = "Agent name"),
        ("run_id" = Uuid, Path, description = "Run ID")
    ),
    responses(
        (status = 200, description = "Run snapshot", body = Run),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<AppState>,
    Path((agent, run_id)): Path<(String, Uuid)>,
) -> Result<Json<Run>, AppError> {
    let coordinator = state.agent(&agent)?;
    Ok(Json(coordinator.run_status(run_id)?))
}
