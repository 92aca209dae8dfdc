use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use serde::Serialize;

use crate::catalog::StateMachine;
use crate::engine::types::{Run, RunId};

use super::AppState;
use super::errors::AppError;

// --- Response types ---

#[derive(Serialize)]
pub struct RunMachineResponse {
    pub id: RunId,
    pub message: String,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<Run>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

const USAGE: &str = "\
GET    /machines          list state machines
GET    /machines/{name}   show one state machine
GET    /runs              list active runs
GET    /runs/{id}         show a run (active or finished)
POST   /runs/{machine}    start a run; the request body is the input
DELETE /runs/{id}         cancel an active run
";

// --- Handlers ---

/// GET /
pub async fn usage() -> &'static str {
    USAGE
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /machines
pub async fn list_machines(State(state): State<Arc<AppState>>) -> Json<Vec<StateMachine>> {
    Json(state.catalog.machines().to_vec())
}

/// GET /machines/:name
pub async fn get_machine(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<StateMachine>, AppError> {
    state
        .catalog
        .get(&name)
        .cloned()
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("State machine '{}' not found", name)))
}

/// GET /runs
pub async fn list_runs(State(state): State<Arc<AppState>>) -> Json<ListRunsResponse> {
    let runs = state.scheduler.list_active();
    let total = runs.len();
    Json(ListRunsResponse { runs, total })
}

/// GET /runs/:id
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Run>, AppError> {
    let id = parse_run_id(&id)?;
    let run = state.scheduler.get_run(id).await?;
    Ok(Json(run))
}

/// POST /runs/:machine
pub async fn run_machine(
    State(state): State<Arc<AppState>>,
    Path(machine): Path<String>,
    body: Bytes,
) -> Result<Json<RunMachineResponse>, AppError> {
    let id = state
        .scheduler
        .schedule_machine(&state.catalog, &machine, body.to_vec())
        .await?;

    Ok(Json(RunMachineResponse {
        id,
        message: format!(
            "The state machine {} was scheduled for execution successfully.",
            machine
        ),
    }))
}

/// DELETE /runs/:id
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    let id = parse_run_id(&id)?;
    state.scheduler.cancel(id).await?;

    Ok(Json(MessageResponse {
        message: "State machine run cancelled successfully".to_string(),
    }))
}

// --- Helpers ---

fn parse_run_id(raw: &str) -> Result<RunId, AppError> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid run id '{}'", raw)))
}
