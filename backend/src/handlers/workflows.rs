use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::workflows::{
    Execution, ExecutionOutcome, PendingSweep, Trigger, TriggerKind, WorkflowDefinition,
    WorkflowStats,
};
use crate::AppState;

pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_workflows))
        .route("/execute", post(execute_workflow))
        .route("/process-pending", post(process_pending))
        .route("/:id", get(get_workflow))
        .route("/:id/stats", get(workflow_stats))
        .route("/:id/executions", get(list_executions))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteWorkflowRequest {
    pub workflow_id: Uuid,
    pub lead_id: i64,
    pub trigger_kind: TriggerKind,
    #[serde(default)]
    pub trigger_payload: serde_json::Value,
    #[serde(default)]
    pub force_execute: bool,
}

#[derive(Debug, Serialize)]
pub struct ExecuteWorkflowResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct ProcessPendingResponse {
    pub status: &'static str,
    pub executions_queued: usize,
    pub actions_total: usize,
}

#[derive(Debug, Serialize)]
pub struct WorkflowDetailResponse {
    #[serde(flatten)]
    pub workflow: WorkflowDefinition,
    pub recent_executions: Vec<Execution>,
}

async fn execute_workflow(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExecuteWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<ExecuteWorkflowResponse>)> {
    let trigger = Trigger::new(payload.trigger_kind, payload.trigger_payload);

    let outcome = state
        .engine
        .execute_workflow(
            payload.workflow_id,
            payload.lead_id,
            trigger,
            payload.force_execute,
        )
        .await?;

    let response = match outcome {
        ExecutionOutcome::Created {
            execution_id,
            workflow_name,
        } => (
            StatusCode::CREATED,
            Json(ExecuteWorkflowResponse {
                status: "created",
                execution_id: Some(execution_id),
                workflow_name: Some(workflow_name),
                reason: None,
            }),
        ),
        ExecutionOutcome::Skipped(reason) => (
            StatusCode::OK,
            Json(ExecuteWorkflowResponse {
                status: "skipped",
                execution_id: None,
                workflow_name: None,
                reason: Some(reason.as_str()),
            }),
        ),
    };

    Ok(response)
}

async fn process_pending(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ProcessPendingResponse>> {
    let PendingSweep {
        executions_queued,
        actions_total,
    } = state.engine.process_pending().await?;

    let status = if actions_total == 0 {
        "no_pending_actions"
    } else {
        "processing"
    };

    Ok(Json(ProcessPendingResponse {
        status,
        executions_queued,
        actions_total,
    }))
}

async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<WorkflowDefinition>>> {
    let workflows = state.store.list_workflows().await?;
    Ok(Json(workflows))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowDetailResponse>> {
    let workflow = state
        .store
        .get_workflow(id)
        .await?
        .ok_or_else(|| crate::error::AppError::NotFound("Workflow".to_string()))?;

    let recent_executions = state.store.recent_executions(id, 20).await?;

    Ok(Json(WorkflowDetailResponse {
        workflow,
        recent_executions,
    }))
}

async fn workflow_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowStats>> {
    let stats = state.engine.workflow_stats(id).await?;
    Ok(Json(stats))
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Execution>>> {
    state
        .store
        .get_workflow(id)
        .await?
        .ok_or_else(|| crate::error::AppError::NotFound("Workflow".to_string()))?;

    let executions = state.store.recent_executions(id, 100).await?;
    Ok(Json(executions))
}
