use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use events::EventStream;
use futures::stream::{Stream, StreamExt};
use protocol_core::{Event, Request};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub const SSE_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub run_id: Uuid,
    #[serde(default)]
    pub stream: bool,
    pub since: Option<u64>,
}

/// Cursor for a read: the `Last-Event-ID` header of a reconnecting
/// EventSource wins over the `since` query parameter.
fn resume_cursor(since: Option<u64>, headers: &HeaderMap) -> Result<Option<u64>, AppError> {
    let Some(value) = headers.get("Last-Event-ID") else {
        return Ok(since);
    };

    value
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| AppError::BadRequest("Last-Event-ID must be an event id".to_string()))
}

/// An event that fails to serialize ends the stream rather than reaching
/// the client as a frame it cannot parse.
fn to_sse_event(event: &Event) -> Result<SseEvent, axum::Error> {
    SseEvent::default()
        .id(event.id.to_string())
        .event(event.type_name())
        .json_data(event)
        .map_err(|e| {
            tracing::error!(
                run_id = %event.run_id,
                event_id = event.id,
                error = %e,
                "Failed to serialize event, closing stream"
            );
            e
        })
}

fn into_sse(events: EventStream) -> Sse<impl Stream<Item = Result<SseEvent, axum::Error>>> {
    Sse::new(events.map(|event| to_sse_event(&event))).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}

#[utoipa::path(
    get,
    path = "/{agent}/get_events",
    params(
        ("agent" = String, Path, description = "Agent name"),
        ("run_id" = Uuid, Query, description = "Run ID"),
        ("stream" = Option<bool>, Query, description = "Stream as SSE until the terminal event"),
        ("since" = Option<u64>, Query, description = "Only events with a greater id"),
    ),
    responses(
        (status = 200, description = "Events as a JSON array, or an SSE stream", body = Vec<Event>),
        (status = 404, description = "Agent or run not found")
    ),
    tag = "events"
)]
pub async fn get_events(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let coordinator = state.agent(&agent)?;
    let since = resume_cursor(query.since, &headers)?;

    if query.stream {
        let events = coordinator.stream_events(query.run_id, since).await?;
        Ok(into_sse(events).into_response())
    } else {
        let events = coordinator.get_events(query.run_id, since).await?;
        Ok(Json(events).into_response())
    }
}

#[utoipa::path(
    post,
    path = "/{agent}/stream_request",
    params(
        ("agent" = String, Path, description = "Agent name")
    ),
    request_body = Request,
    responses(
        (status = 200, description = "SSE stream of the events the request causes"),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "Thread busy or run in the wrong state")
    ),
    tag = "events"
)]
pub async fn stream_request(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, AppError> {
    let coordinator = state.agent(&agent)?;
    let request = Request::from_json(body)?;
    let events = coordinator.submit_and_stream(request).await?;
    Ok(into_sse(events))
}

#[utoipa::path(
    get,
    path = "/{agent}/get_events/{thread_id}",
    params(
        ("agent" = String, Path, description = "Agent name"),
        ("thread_id" = Uuid, Path, description = "Thread ID")
    ),
    responses(
        (status = 200, description = "Every event of the thread, oldest run first", body = Vec<Event>),
        (status = 404, description = "Thread not found")
    ),
    tag = "events"
)]
pub async fn thread_history(
    State(state): State<AppState>,
    Path((agent, thread_id)): Path<(String, Uuid)>,
) -> Result<Json<Vec<Event>>, AppError> {
    let coordinator = state.agent(&agent)?;
    Ok(Json(coordinator.thread_history(thread_id).await?))
}
