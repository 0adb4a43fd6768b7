//! Request handlers for the HTTP API (spec.md §6).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent::ResultCallback;
use crate::error::Error;
use crate::models::{Execution, ExecutionStatus, Function, Vm};
use crate::scheduler::InvocationResult;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Serialize)]
pub struct PoolStats {
    warm_pool_depth: usize,
}

pub async fn pool_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(PoolStats { warm_pool_depth: state.pool.warm_pool_depth().await })
}

#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    pub input: Value,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub sync: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvokeResponse {
    Accepted { execution_id: Uuid },
    Processing { execution_id: Uuid },
    Completed { execution_id: Uuid, output: Option<String> },
    Failed { execution_id: Uuid, error: Option<String> },
    Timeout { execution_id: Uuid },
}

impl From<InvocationResult> for InvokeResponse {
    fn from(result: InvocationResult) -> Self {
        match result {
            InvocationResult::Accepted { execution_id } => InvokeResponse::Accepted { execution_id },
            InvocationResult::Processing { execution_id } => InvokeResponse::Processing { execution_id },
            InvocationResult::Terminal(execution) => execution_to_response(execution),
        }
    }
}

fn execution_to_response(execution: Execution) -> InvokeResponse {
    match execution.status {
        ExecutionStatus::Completed => InvokeResponse::Completed { execution_id: execution.id, output: execution.output },
        ExecutionStatus::Timeout => InvokeResponse::Timeout { execution_id: execution.id },
        _ => InvokeResponse::Failed { execution_id: execution.id, error: execution.error },
    }
}

fn invoke_status_code(response: &InvokeResponse) -> StatusCode {
    match response {
        InvokeResponse::Accepted { .. } => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    }
}

pub async fn invoke_by_id(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<InvokeRequest>,
) -> ApiResult<impl IntoResponse> {
    let result = state.scheduler.schedule(id, req.input, req.context, req.sync).await.map_err(Error::from)?;
    let body: InvokeResponse = result.into();
    Ok((invoke_status_code(&body), Json(body)))
}

pub async fn invoke_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<InvokeRequest>,
) -> ApiResult<impl IntoResponse> {
    let result = state
        .scheduler
        .schedule_by_name(&name, req.input, req.context, req.sync)
        .await
        .map_err(Error::from)?;
    let body: InvokeResponse = result.into();
    Ok((invoke_status_code(&body), Json(body)))
}

pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let result = state.scheduler.get_result(id).await.map_err(Error::from)?;
    Ok(Json(InvokeResponse::from(result)))
}

pub async fn list_executions_for_function(
    State(state): State<AppState>,
    Path(function_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let executions = state.db.list_executions_for_function(function_id).await.map_err(Error::from)?;
    Ok(Json(executions))
}

pub async fn list_vms(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let vms: Vec<Vm> = state.pool.list().await.map_err(Error::from)?;
    Ok(Json(vms))
}

#[derive(Debug, Deserialize)]
pub struct RegisterVmRequest {
    pub ip_address: String,
}

/// The pool manager provisions every VM itself, so there is nothing to
/// create here; this endpoint lets the in-VM agent confirm, once booted,
/// that the control plane's record for its address matches (spec.md §6
/// "Agent reports VM status").
pub async fn register_vm(
    State(state): State<AppState>,
    Json(req): Json<RegisterVmRequest>,
) -> ApiResult<impl IntoResponse> {
    let vms = state.pool.list().await.map_err(Error::from)?;
    match vms.into_iter().find(|v| v.ip_address == req.ip_address) {
        Some(vm) => Ok(Json(vm)),
        None => Err(ApiError(Error::Internal(format!("no pool-managed vm at {}", req.ip_address)))),
    }
}

pub async fn receive_result(
    State(state): State<AppState>,
    Json(report): Json<ResultCallback>,
) -> ApiResult<impl IntoResponse> {
    state.reconciler.receive_result(report).await.map_err(|e| match e {
        crate::reconciler::ReconcileError::ExecutionNotFound => ApiError(Error::ExecutionNotFound),
        crate::reconciler::ReconcileError::Db(db) => ApiError(Error::Db(db)),
    })?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct RegisterFunctionRequest {
    pub name: String,
    pub runtime: String,
    pub memory_mib: i64,
    pub timeout_secs: i64,
    pub code: String,
    #[serde(default)]
    pub requirements: Option<String>,
    #[serde(default)]
    pub config: Option<String>,
}

pub async fn register_function(
    State(state): State<AppState>,
    Json(req): Json<RegisterFunctionRequest>,
) -> ApiResult<impl IntoResponse> {
    let function: Function = state
        .registry
        .register(req.name, req.runtime, req.memory_mib, req.timeout_secs, req.code, req.requirements, req.config)
        .await
        .map_err(Error::from)?;
    Ok((StatusCode::CREATED, Json(function)))
}

pub async fn list_functions(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let functions = state.registry.list().await.map_err(Error::from)?;
    Ok(Json(functions))
}

pub async fn get_function(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let function = state.registry.get_metadata(id).await.map_err(Error::from)?;
    Ok(Json(function))
}

pub async fn delete_function(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    state.registry.delete(id).await.map_err(Error::from)?;
    Ok(StatusCode::NO_CONTENT)
}
