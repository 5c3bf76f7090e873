// HTTP handlers - thin adapters from requests to the pipeline runner

//! Every handler parses its path and body itself so that malformed input
//! surfaces as `UuidParsing` / `RequestRead` / `PipelineParse` through the
//! envelope instead of an extractor rejection.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    Extension,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tokio_util::sync::DropGuard;
use tracing::{info, instrument};
use uuid::Uuid;

use super::types::{
    ok, ApiError, ApiResult, CreateDebugTaskRequest, DebugRunRequest, RejectRequest, RunQuery, TasksQuery,
};
use super::{AppState, RequestId, USER_HEADER};
use crate::engine::block::BlockModel;
use crate::engine::runner::{DebugResult, RunMode, RunResponse, TaskWithSteps};
use crate::integrations::http::CallContext;
use crate::integrations::ProbeResult;
use crate::models::{Scenario, Task, Version};
use crate::{PipelinerError, Result};

const ANONYMOUS: &str = "anonymous";

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| PipelinerError::UuidParsing(format!("{}: {}", raw, e)))
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| PipelinerError::RequestRead(e.to_string()))
}

fn parse_scenario(body: &Bytes) -> Result<Scenario> {
    Scenario::from_json(body)
}

/// Run parameters: an empty body or a JSON object
fn parse_parameters(body: &Bytes) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    match parse_body::<Value>(body)? {
        params @ Value::Object(_) => Ok(params),
        other => Err(PipelinerError::RequestRead(format!(
            "parameters must be an object, got {}",
            other
        ))),
    }
}

fn user(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Writes are attributed; a missing user is refused
fn require_user(headers: &HeaderMap) -> Result<String> {
    user(headers).ok_or(PipelinerError::NoUserInContext)
}

fn call_context(request_id: &RequestId) -> CallContext {
    CallContext {
        request_id: request_id.0.clone(),
        cancel: Default::default(),
    }
}

/// Call context whose token is cancelled once the returned guard drops,
/// i.e. when the handler future completes or the client goes away
fn guarded_call_context(request_id: &RequestId) -> (CallContext, DropGuard) {
    let call = call_context(request_id);
    let guard = call.cancel.clone().drop_guard();
    (call, guard)
}

fn run_mode(state: &AppState, query: &RunQuery) -> RunMode {
    match query.with_stop {
        Some(true) => RunMode::Sync,
        Some(false) => RunMode::Async,
        None if state.async_run_default => RunMode::Async,
        None => RunMode::Sync,
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub services: BTreeMap<&'static str, ProbeResult>,
}

// Runs

/// POST /run/:pipeline_id
#[instrument(name = "run_pipeline", skip_all, fields(request_id = %request_id.0))]
pub async fn run_pipeline(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Path(pipeline_id): Path<String>,
    Query(query): Query<RunQuery>,
    body: Bytes,
) -> ApiResult<RunResponse> {
    let pipeline_id = parse_uuid(&pipeline_id)?;
    let parameters = parse_parameters(&body)?;
    let author = user(&headers).unwrap_or_else(|| ANONYMOUS.to_string());

    let (call, _guard) = guarded_call_context(&request_id);
    let response = state
        .runner
        .run_pipeline(pipeline_id, parameters, &author, run_mode(&state, &query), &call)
        .await?;
    Ok(ok(response))
}

/// POST /run/version/:version_id
#[instrument(name = "run_version", skip_all, fields(request_id = %request_id.0))]
pub async fn run_version(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Path(version_id): Path<String>,
    Query(query): Query<RunQuery>,
    body: Bytes,
) -> ApiResult<RunResponse> {
    let version_id = parse_uuid(&version_id)?;
    let parameters = parse_parameters(&body)?;
    let author = user(&headers).unwrap_or_else(|| ANONYMOUS.to_string());

    let (call, _guard) = guarded_call_context(&request_id);
    let response = state
        .runner
        .run_version(version_id, parameters, &author, run_mode(&state, &query), &call)
        .await?;
    Ok(ok(response))
}

// Debug

/// POST /debug/
#[instrument(name = "create_debug_task", skip_all, fields(request_id = %request_id.0))]
pub async fn create_debug_task(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Task> {
    let req: CreateDebugTaskRequest = parse_body(&body)?;
    let author = user(&headers).unwrap_or_else(|| ANONYMOUS.to_string());
    let parameters = match req.parameters {
        Value::Null => Value::Object(Map::new()),
        params => params,
    };

    let task = state.runner.create_debug_task(req.version_id, parameters, &author).await?;
    info!(task_id = %task.id, version_id = %req.version_id, "debug task created");
    Ok(ok(task))
}

/// POST /debug/run
#[instrument(name = "start_debug_task", skip_all, fields(request_id = %request_id.0))]
pub async fn debug_run(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Bytes,
) -> ApiResult<DebugResult> {
    let req: DebugRunRequest = parse_body(&body)?;
    let (call, _guard) = guarded_call_context(&request_id);
    let result = state
        .runner
        .debug_run(req.task_id, req.break_points, req.action, &call)
        .await?;
    Ok(ok(result))
}

// Reads

/// GET /pipelines/:id
pub async fn get_pipeline(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Scenario> {
    let id = parse_uuid(&id)?;
    Ok(ok(state.runner.get_pipeline(id).await?))
}

/// GET /pipelines/:id/versions
pub async fn list_versions(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<Version>> {
    let id = parse_uuid(&id)?;
    Ok(ok(state.runner.list_versions(id).await?))
}

/// GET /versions/:id
pub async fn get_version(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Version> {
    let id = parse_uuid(&id)?;
    Ok(ok(state.runner.get_version(id).await?))
}

/// GET /tasks/:id
pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<TaskWithSteps> {
    let id = parse_uuid(&id)?;
    Ok(ok(state.runner.get_task_with_steps(id).await?))
}

/// GET /tasks
pub async fn list_tasks(State(state): State<AppState>, Query(query): Query<TasksQuery>) -> ApiResult<Vec<Task>> {
    Ok(ok(state.runner.list_tasks(query.version_id).await?))
}

/// POST /tasks/:id/cancel
pub async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    let id = parse_uuid(&id)?;
    state.runner.cancel_task(id)?;
    Ok(ok(json!({ "task_id": id })))
}

/// GET /health
pub async fn health(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
) -> ApiResult<HealthReport> {
    let services = state.runner.health(&call_context(&request_id)).await;
    let status = if services.values().all(|p| p.ok) { "ok" } else { "degraded" };
    Ok(ok(HealthReport {
        status,
        version: env!("CARGO_PKG_VERSION"),
        services,
    }))
}

/// GET /modules
pub async fn modules(State(state): State<AppState>) -> ApiResult<Vec<BlockModel>> {
    Ok(ok(state.runner.modules()))
}

/// GET /modules/:name/usage
pub async fn module_usage(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Value> {
    let pipelines = state.runner.module_usage(&name).await?;
    Ok(ok(json!({ "name": name, "used_by": pipelines })))
}

// Lifecycle

/// POST /pipelines
#[instrument(name = "create_pipeline", skip_all)]
pub async fn create_pipeline(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult<Version> {
    let author = require_user(&headers)?;
    let scenario = parse_scenario(&body)?;
    Ok(ok(state.runner.create_pipeline(scenario, &author).await?))
}

/// DELETE /pipelines/:id
#[instrument(name = "delete_pipeline", skip_all, fields(request_id = %request_id.0))]
pub async fn delete_pipeline(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    require_user(&headers)?;
    let id = parse_uuid(&id)?;
    state.runner.delete_pipeline(id, &call_context(&request_id)).await?;
    Ok(ok(json!({ "id": id })))
}

/// POST /pipelines/:id/versions
#[instrument(name = "create_pipeline_version", skip_all)]
pub async fn create_version(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Version> {
    let author = require_user(&headers)?;
    let id = parse_uuid(&id)?;
    let scenario = parse_scenario(&body)?;
    Ok(ok(state.runner.create_version(id, scenario, &author).await?))
}

/// PUT /versions
#[instrument(name = "edit_version", skip_all)]
pub async fn update_draft(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult<Version> {
    require_user(&headers)?;
    let scenario = parse_scenario(&body)?;
    Ok(ok(state.runner.update_draft(scenario).await?))
}

/// DELETE /versions/:id
pub async fn delete_version(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    require_user(&headers)?;
    let id = parse_uuid(&id)?;
    state.runner.delete_version(id).await?;
    Ok(ok(json!({ "version_id": id })))
}

/// POST /versions/:id/send-to-approve
pub async fn send_to_approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    require_user(&headers)?;
    let id = parse_uuid(&id)?;
    state.runner.send_to_approve(id).await?;
    Ok(ok(json!({ "version_id": id })))
}

/// POST /versions/:id/approve
pub async fn approve(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> ApiResult<Value> {
    let author = require_user(&headers)?;
    let id = parse_uuid(&id)?;
    state.runner.approve(id, &author).await?;
    Ok(ok(json!({ "version_id": id })))
}

/// POST /versions/:id/reject
pub async fn reject(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Value> {
    let author = require_user(&headers)?;
    let id = parse_uuid(&id)?;
    let req: RejectRequest = parse_body(&body)?;
    state.runner.reject(id, &req.comment, &author).await?;
    Ok(ok(json!({ "version_id": id })))
}

/// POST /pipelines/:id/rollback/:version_id
pub async fn rollback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, version_id)): Path<(String, String)>,
) -> ApiResult<Value> {
    require_user(&headers)?;
    let id = parse_uuid(&id)?;
    let version_id = parse_uuid(&version_id)?;
    state.runner.rollback(id, version_id).await?;
    Ok(ok(json!({ "id": id, "version_id": version_id })))
}

// Tags

/// GET /pipelines/:id/tags
pub async fn get_tags(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<String>> {
    let id = parse_uuid(&id)?;
    Ok(ok(state.runner.get_tags(id).await?))
}

/// PUT /pipelines/:id/tags/:tag
pub async fn attach_tag(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, tag)): Path<(String, String)>,
) -> ApiResult<Vec<String>> {
    require_user(&headers)?;
    let id = parse_uuid(&id)?;
    state.runner.attach_tag(id, &tag).await?;
    Ok(ok(state.runner.get_tags(id).await?))
}

/// DELETE /pipelines/:id/tags/:tag
pub async fn detach_tag(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, tag)): Path<(String, String)>,
) -> ApiResult<Vec<String>> {
    require_user(&headers)?;
    let id = parse_uuid(&id)?;
    state.runner.detach_tag(id, &tag).await?;
    Ok(ok(state.runner.get_tags(id).await?))
}

/// GET /pipelines/:id/scheduler-tasks
pub async fn scheduler_tasks(Path(_id): Path<String>) -> std::result::Result<(), ApiError> {
    Err(ApiError(PipelinerError::Teapot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_parameters() {
        assert_eq!(parse_parameters(&Bytes::from_static(b"")).unwrap(), json!({}));
        assert_eq!(parse_parameters(&Bytes::from_static(b"  \n")).unwrap(), json!({}));
        assert_eq!(
            parse_parameters(&Bytes::from_static(br#"{"Input":"Value"}"#)).unwrap(),
            json!({ "Input": "Value" })
        );
        assert!(matches!(
            parse_parameters(&Bytes::from_static(b"[1,2]")),
            Err(PipelinerError::RequestRead(_))
        ));
        assert!(matches!(
            parse_parameters(&Bytes::from_static(b"{oops")),
            Err(PipelinerError::RequestRead(_))
        ));
    }

    #[test]
    fn test_parse_uuid() {
        assert!(matches!(parse_uuid("not-a-uuid"), Err(PipelinerError::UuidParsing(_))));
        assert_eq!(parse_uuid(&Uuid::nil().to_string()).unwrap(), Uuid::nil());
    }

    #[test]
    fn test_user_header() {
        let mut headers = HeaderMap::new();
        assert!(matches!(require_user(&headers), Err(PipelinerError::NoUserInContext)));
        headers.insert(USER_HEADER, "  ".parse().unwrap());
        assert!(user(&headers).is_none());
        headers.insert(USER_HEADER, "j.doe".parse().unwrap());
        assert_eq!(require_user(&headers).unwrap(), "j.doe");
    }
}
