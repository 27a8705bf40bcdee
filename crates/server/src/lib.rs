pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use std::future::Future;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use error::StartupError;
use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Agent Protocol API",
        version = "0.1.0",
        description = "Run-lifecycle API for agents: threads, runs and event streams"
    ),
    paths(
        routes::health_check,
        routes::list_agents,
        routes::describe_agent,
        routes::run,
        routes::get_run,
        routes::sse::get_events,
        routes::sse::stream_request,
        routes::sse::thread_history,
        routes::list_threads,
        routes::create_thread,
        routes::delete_thread,
    ),
    components(schemas(
        routes::HealthResponse,
        protocol_core::AgentDescriptor,
        protocol_core::AgentEntry,
        protocol_core::AgentOperation,
        protocol_core::Event,
        protocol_core::EventPayload,
        protocol_core::FinishReason,
        protocol_core::Role,
        protocol_core::Request,
        protocol_core::RequestBody,
        protocol_core::Run,
        protocol_core::RunState,
        protocol_core::Thread,
    )),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "agents", description = "Agent listing and descriptors"),
        (name = "runs", description = "Request submission and run status"),
        (name = "events", description = "Event logs and SSE streams"),
        (name = "threads", description = "Thread management endpoints"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", ApiDoc::openapi()))
        .route("/", get(routes::list_agents))
        .route("/health", get(routes::health_check))
        .route("/{agent}/describe", get(routes::describe_agent))
        .route("/{agent}/run", post(routes::run))
        .route("/{agent}/runs/{run_id}", get(routes::get_run))
        .route("/{agent}/get_events", get(routes::get_events))
        .route("/{agent}/get_events/{thread_id}", get(routes::thread_history))
        .route("/{agent}/stream_request", post(routes::stream_request))
        .route(
            "/{agent}/threads",
            get(routes::list_threads).post(routes::create_thread),
        )
        .route("/{agent}/threads/{thread_id}", delete(routes::delete_thread))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then cancel every live run so open
/// event streams reach their terminal events and close.
pub async fn serve(
    state: AppState,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), StartupError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    let registry = Arc::clone(&state.registry);
    let stop = async move {
        shutdown.await;
        tracing::info!("Shutting down");
        registry.shutdown().await;
    };

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(stop)
        .await?;

    Ok(())
}
