use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{StreamExt, future};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::agent::{AgentDescriptor, execute_run};
use crate::config::{AppConfig, RuntimeSettings};
use crate::error::ApiError;
use crate::llm::ChatCompletionsBackend;
use crate::messages::Message;
use crate::runs::{Run, RunEvent, RunStatus};
use crate::session::Session;
use crate::sse::build_sse_response;

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>, settings: RuntimeSettings) -> anyhow::Result<()> {
    info!(
        name: "backend.config.loaded",
        base_url = %settings.backend.base_url,
        model = %settings.backend.model,
        "backend configuration loaded"
    );

    let backend = Arc::new(ChatCompletionsBackend::new(settings.backend.clone()));
    let state = AppState::new(backend, &settings.backend, settings.sampling);

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Build the REST surface. Exposed separately from [`start_server`] so tests
/// can run the real router against a scripted backend.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/healthz", get(healthz))
        .route("/agents", get(list_agents))
        .route("/agents/{name}", get(get_agent))
        .route("/runs", post(create_run))
        .route("/runs/{run_id}", get(get_run).post(resume_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/runs/{run_id}/events", get(run_events))
        .route("/session/{session_id}", get(get_session))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /ping - liveness, empty object response.
async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({}))
}

/// GET /healthz - backend health probe.
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.backend.health().await)
}

#[derive(Debug, Deserialize)]
struct Pagination {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct AgentList {
    agents: Vec<AgentDescriptor>,
}

/// GET /agents - paginated list of agent descriptors.
async fn list_agents(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> Json<AgentList> {
    let limit = page.limit.unwrap_or(10);
    let offset = page.offset.unwrap_or(0);

    // A single fixed agent definition; pagination still honored.
    let agents = [state.agent.clone()]
        .into_iter()
        .skip(offset)
        .take(limit)
        .collect();
    Json(AgentList { agents })
}

/// GET /agents/{name} - single agent descriptor.
async fn get_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<AgentDescriptor>, ApiError> {
    if name == state.agent.name {
        Ok(Json(state.agent.clone()))
    } else {
        Err(ApiError::not_found(format!("agent {name} not found")))
    }
}

/// Execution mode for run creation.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum RunMode {
    #[default]
    Sync,
    Async,
    Stream,
}

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    agent_name: Option<String>,
    input: Option<Vec<Message>>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    mode: RunMode,
}

/// POST /runs - create and execute a run.
///
/// `sync` waits for the terminal status (200), `async` returns the created
/// snapshot immediately (202), `stream` pushes lifecycle events as SSE.
async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<Response, ApiError> {
    let agent_name = req
        .agent_name
        .ok_or_else(|| ApiError::invalid_input("agent_name is required"))?;
    let input = req
        .input
        .ok_or_else(|| ApiError::invalid_input("input is required"))?;
    if agent_name != state.agent.name {
        return Err(ApiError::not_found(format!("agent {agent_name} not found")));
    }

    let run = state.tracker.create(&agent_name, req.session_id);
    tracing::info!(run_id = %run.run_id, mode = ?req.mode, "received run request");

    let execution = execute_run(
        state.tracker.clone(),
        Arc::clone(&state.backend),
        run.run_id.clone(),
        agent_name,
        input,
        state.params,
    );

    match req.mode {
        RunMode::Sync => {
            execution.await;
            let run = state.tracker.get(&run.run_id).unwrap_or(run);
            if let Some(error) = &run.error {
                // Backend failure: fail transition already recorded, surface
                // a server_error response pointing at the run.
                let mut err = ApiError::server_error(error.message.clone());
                err.data = serde_json::json!({ "run_id": run.run_id });
                return Err(err);
            }
            Ok((StatusCode::OK, Json(run)).into_response())
        }
        RunMode::Async => {
            tokio::spawn(execution);
            Ok((StatusCode::ACCEPTED, Json(run)).into_response())
        }
        RunMode::Stream => {
            // Subscribe before spawning so no lifecycle frame is missed;
            // the backlog covers events appended before the subscription.
            let rx = state
                .tracker
                .subscribe(&run.run_id)
                .ok_or_else(|| ApiError::server_error("run vanished before streaming"))?;
            let backlog = state.tracker.events(&run.run_id).unwrap_or_default();
            tokio::spawn(execution);

            let live = BroadcastStream::new(rx)
                .filter_map(|res: Result<RunEvent, _>| future::ready(res.ok()));
            let events = futures::stream::iter(backlog)
                .chain(live)
                .scan(false, |ended, event| {
                    if *ended {
                        return future::ready(None);
                    }
                    *ended = event.is_terminal();
                    future::ready(Some(event))
                });

            Ok(build_sse_response(events).into_response())
        }
    }
}

/// GET /runs/{run_id} - current run snapshot.
async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    state
        .tracker
        .get(&run_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("run {run_id} not found")))
}

#[derive(Debug, Deserialize)]
struct ResumeRequest {
    #[serde(default)]
    await_resume: serde_json::Value,
}

/// POST /runs/{run_id} - resume an awaiting run.
async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<Run>, ApiError> {
    let run = state.tracker.resume(&run_id, &req.await_resume)?;
    Ok(Json(run))
}

/// POST /runs/{run_id}/cancel - cancel; idempotent on terminal runs.
async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let run = state.tracker.cancel(&run_id)?;
    if run.status == RunStatus::Cancelled {
        tracing::info!(run_id = %run_id, "run cancelled");
    }
    Ok((StatusCode::ACCEPTED, Json(run)).into_response())
}

#[derive(Debug, Serialize)]
struct EventList {
    events: Vec<RunEvent>,
}

/// GET /runs/{run_id}/events - ordered event list.
async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<EventList>, ApiError> {
    state
        .tracker
        .events(&run_id)
        .map(|events| Json(EventList { events }))
        .ok_or_else(|| ApiError::not_found(format!("run {run_id} not found")))
}

/// GET /session/{session_id} - session descriptor.
async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .tracker
        .sessions()
        .get(&session_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("session {session_id} not found")))
}
