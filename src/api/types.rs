// HTTP API types - response envelope, error mapping and request bodies

//! # API Types
//!
//! Every response is wrapped in the same envelope:
//!
//! ```json
//! { "status_code": 200, "data": { … } }
//! { "status_code": 500, "error": "can't run pipeline: …", "description": "…" }
//! ```
//!
//! `Teapot` answers 418; every other error answers 500. The numeric
//! [`error_code`] of each kind is stable and is logged with the failure.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use crate::models::DebugAction;
use crate::PipelinerError;

/// Successful response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// Error response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status_code: u16,
    pub error: String,
    pub description: String,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        status_code: StatusCode::OK.as_u16(),
        data: Some(data),
    })
}

/// An error on its way out of a handler
#[derive(Debug)]
pub struct ApiError(pub PipelinerError);

impl From<PipelinerError> for ApiError {
    fn from(err: PipelinerError) -> Self {
        ApiError(err)
    }
}

pub type ApiResult<T> = std::result::Result<Json<Envelope<T>>, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            PipelinerError::Teapot => StatusCode::IM_A_TEAPOT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            status_code: self.status().as_u16(),
            error: self.0.to_string(),
            description: description(&self.0).to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.body();
        error!(code = error_code(&self.0), status = body.status_code, error = %self.0, "request failed");
        (self.status(), Json(body)).into_response()
    }
}

/// Stable numeric code of an error kind
///
/// Runtime kinds that escape a handler are reported as execution failures.
pub fn error_code(err: &PipelinerError) -> u16 {
    use PipelinerError::*;
    match err {
        Unknown(_) => 0,
        UuidParsing(_) => 1,
        RequestRead(_) => 2,
        PipelineParse(_) => 3,
        PipelineWrite(_) => 5,
        GetPipeline(_) => 9,
        GetVersion(_) => 10,
        PipelineIsDraft(_) => 11,
        Approve(_) => 12,
        PipelineDelete(_) => 13,
        PipelineCreate(_) => 14,
        ModuleUsage(_) => 15,
        PipelineRun(_) => 16,
        Teapot => 17,
        PipelineExecution(_) => 18,
        PipelineOutputGrab(_) => 19,
        Unauth => 21,
        AuthService(_) => 22,
        GetTasks(_) => 23,
        GetTag(_) => 27,
        TagAttach(_) => 30,
        TagDetach(_) => 33,
        PipelineHasDraft(_) => 36,
        SchedulerClient(_) => 37,
        PipelineNameUsed(_) => 38,
        GetTask(_) => 39,
        NetworkMonitorClient(_) => 40,
        NoUserInContext => 41,
        _ => 18,
    }
}

fn description(err: &PipelinerError) -> &'static str {
    use PipelinerError::*;
    match err {
        RequestRead(_) => "The request could not be read",
        UuidParsing(_) => "The identifier could not be read",
        PipelineParse(_) => "The scenario could not be parsed",
        PipelineIsDraft(_) => "An approved scenario can't be edited, create a new version",
        PipelineHasDraft(_) => "A draft of this scenario already exists",
        PipelineNameUsed(_) => "A scenario with this name already exists",
        GetPipeline(_) | GetVersion(_) => "Scenario information could not be loaded",
        GetTask(_) | GetTasks(_) => "Scenario runs could not be found",
        PipelineCreate(_) => "The scenario could not be created",
        PipelineWrite(_) => "The scenario could not be saved",
        PipelineDelete(_) => "The scenario could not be deleted",
        Approve(_) => "The scenario could not be approved",
        PipelineRun(_) => "The scenario could not be started",
        PipelineOutputGrab(_) => "Scenario outputs could not be collected",
        ModuleUsage(_) => "Function usage in scenarios could not be looked up",
        TagAttach(_) => "The tag could not be attached",
        TagDetach(_) => "The tag could not be detached",
        GetTag(_) => "Tag information could not be loaded",
        SchedulerClient(_) => "Scheduler client failed",
        NetworkMonitorClient(_) => "Network monitor client failed",
        AuthService(_) => "Authorization service failed",
        Unauth | NoUserInContext => "Not allowed",
        Teapot => "This feature is planned but not implemented yet",
        Unknown(_) => "Something unexpected happened",
        _ => "An error occurred while executing the scenario",
    }
}

/// Query of the run endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunQuery {
    /// Wait for the task and return its outputs
    pub with_stop: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDebugTaskRequest {
    pub version_id: Uuid,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugRunRequest {
    pub task_id: Uuid,
    #[serde(default)]
    pub break_points: Vec<String>,
    pub action: DebugAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TasksQuery {
    pub version_id: Option<Uuid>,
}
