//! Operational REST surface, health probe and metrics endpoint.

use crate::requests::{AgentSpec, ScheduleSpec, TaskSpec, WorkflowSpec};
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use maestro_coordinator::{AgentUpdate, TaskFilter};
use maestro_core::{AgentStatus, MaestroError, TaskStatus};
use maestro_scheduler::ScheduleUpdate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// REST error envelope. The error taxonomy maps onto status codes: NotFound
/// → 404, InvalidState → 409, Invalid → 400, QueueFull → 429, the rest →
/// 500.
pub struct ApiError(MaestroError);

impl From<MaestroError> for ApiError {
    fn from(err: MaestroError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MaestroError::NotFound { .. } => StatusCode::NOT_FOUND,
            MaestroError::InvalidState { .. } => StatusCode::CONFLICT,
            MaestroError::Invalid(_) => StatusCode::BAD_REQUEST,
            MaestroError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/agents", post(create_agent).get(list_agents))
        .route(
            "/agents/{id}",
            get(get_agent).put(update_agent).delete(delete_agent),
        )
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/execute", post(execute_workflow))
        .route("/schedules", post(create_schedule).get(list_schedules))
        .route(
            "/schedules/{id}",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
}

// --- health & metrics ---

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub time: chrono::DateTime<Utc>,
    pub connected_clients: usize,
    pub connected_agents: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        time: Utc::now(),
        connected_clients: state.clients.client_count().await,
        connected_agents: state.manager.connected_count().await,
    })
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let counts = state.coordinator.task_counts().await;
    let connections = state.manager.connection_stats().await;
    match state.metrics.render(counts, &connections) {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// --- agents ---

async fn create_agent(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<AgentSpec>,
) -> ApiResult<impl IntoResponse> {
    let agent = state.coordinator.register_agent(spec.into_agent()).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn list_agents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coordinator.list_agents().await)
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.coordinator.get_agent(&id).await?))
}

#[derive(Debug, Deserialize)]
struct AgentUpdateRequest {
    name: Option<String>,
    capabilities: Option<Vec<String>>,
    config: Option<HashMap<String, serde_json::Value>>,
    metadata: Option<HashMap<String, String>>,
    status: Option<AgentStatus>,
}

async fn update_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AgentUpdateRequest>,
) -> ApiResult<impl IntoResponse> {
    let update = AgentUpdate {
        name: req.name,
        capabilities: req.capabilities,
        config: req.config,
        metadata: req.metadata,
        status: req.status,
    };
    Ok(Json(state.coordinator.update_agent(&id, update).await?))
}

async fn delete_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state.coordinator.unregister_agent(&id).await;
    StatusCode::NO_CONTENT
}

// --- tasks ---

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<TaskSpec>,
) -> ApiResult<impl IntoResponse> {
    let task = state.coordinator.submit_task(spec.into_task()).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct TaskQuery {
    status: Option<TaskStatus>,
    agent_id: Option<String>,
    workflow_id: Option<String>,
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskQuery>,
) -> impl IntoResponse {
    let filter = TaskFilter {
        status: query.status,
        agent_id: query.agent_id,
        workflow_id: query.workflow_id,
    };
    Json(state.coordinator.list_tasks(&filter).await)
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.coordinator.get_task(&id).await?))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.coordinator.cancel_task(&id).await?))
}

// --- workflows ---

async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<WorkflowSpec>,
) -> ApiResult<impl IntoResponse> {
    let workflow = state.coordinator.submit_workflow(spec.into_workflow()).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

async fn list_workflows(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coordinator.list_workflows().await)
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.coordinator.get_workflow(&id).await?))
}

async fn execute_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let workflow = state.engine.execute(&id).await?;
    Ok(Json(serde_json::json!({
        "workflow_id": workflow.id,
        "status": workflow.status,
    })))
}

// --- schedules ---

async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<ScheduleSpec>,
) -> ApiResult<impl IntoResponse> {
    let schedule = state.scheduler.add_schedule(spec.into_schedule()).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn list_schedules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.scheduler.list_schedules().await)
}

async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.get_schedule(&id).await?))
}

#[derive(Debug, Deserialize)]
struct ScheduleUpdateRequest {
    name: Option<String>,
    cron: Option<String>,
    enabled: Option<bool>,
    payload: Option<HashMap<String, serde_json::Value>>,
}

async fn update_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ScheduleUpdateRequest>,
) -> ApiResult<impl IntoResponse> {
    let update = ScheduleUpdate {
        name: req.name,
        cron: req.cron,
        enabled: req.enabled,
        payload: req.payload,
    };
    Ok(Json(state.scheduler.update_schedule(&id, update).await?))
}

async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state.scheduler.remove_schedule(&id).await;
    StatusCode::NO_CONTENT
}
