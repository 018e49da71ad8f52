//! REST surface for workflows and instances.
//!
//! GET  /api/workflows                - list workflow definitions
//! POST /api/workflows/:name/start    - start a new instance
//! GET  /api/instances/:id            - full instance projection
//! POST /api/instances/:id/advance    - report a step outcome
//! POST /api/instances/:id/resume     - reconcile and resume

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value};

use waypoint_core::engine::TransitionOutput;
use waypoint_core::error::EngineError;
use waypoint_core::models::{StepReport, WorkflowInstance};
use waypoint_core::state::AppState;

pub fn workflows_router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workflows))
        .route("/:name/start", post(start_workflow))
}

pub fn instances_router() -> Router<AppState> {
    Router::new()
        .route("/:id", get(get_instance))
        .route("/:id/advance", post(advance_workflow))
        .route("/:id/resume", post(resume_workflow))
}

async fn list_workflows(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!({ "workflows": state.engine.list_workflows() }))
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    #[serde(default)]
    context: Option<Map<String, Value>>,
}

async fn start_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<StartRequest>,
) -> Result<Json<TransitionOutput>, EngineError> {
    let output = state.engine.start_workflow(&name, body.context).await?;
    Ok(Json(output))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowInstance>, EngineError> {
    let instance = state.store.get(&id).await.map_err(EngineError::from)?;
    Ok(Json(instance))
}

#[derive(Debug, Deserialize)]
struct AdvanceRequest {
    report: StepReport,
    #[serde(default)]
    context_updates: Option<Map<String, Value>>,
}

async fn advance_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AdvanceRequest>,
) -> Result<Json<TransitionOutput>, EngineError> {
    let output = state
        .engine
        .advance_workflow(&id, &body.report, body.context_updates)
        .await?;
    Ok(Json(output))
}

#[derive(Debug, Deserialize)]
struct ResumeRequest {
    assumed_current_step_name: String,
    report: StepReport,
    #[serde(default)]
    context_updates: Option<Map<String, Value>>,
}

async fn resume_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResumeRequest>,
) -> Result<Json<TransitionOutput>, EngineError> {
    let output = state
        .engine
        .resume_workflow(
            &id,
            &body.assumed_current_step_name,
            &body.report,
            body.context_updates,
        )
        .await?;
    Ok(Json(output))
}
