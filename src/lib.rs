// Pipeliner - Rust Edition
// A scenario execution service: versioned block graphs, resumable steps, cached integrations

//! # Pipeliner Library
//!
//! This is the library root for Pipeliner, the runtime that executes user-defined
//! scenarios. A scenario is a graph of typed blocks; a task is one run of a
//! scenario version; every block execution is persisted as a step so that a
//! task can be inspected, paused on breakpoints and resumed.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`Scenario`] / [`Version`]: the persisted block graph and its revisions
//! - [`Task`] / [`Step`]: a run and its audit trail
//! - [`CalendarDays`]: work-calendar data consumed by the SLA calculator
//!
//! ### Engine
//! - [`VariableStore`]: the flat, qualified-name dataflow medium between blocks
//! - [`Block`]: the protocol every executable block satisfies
//! - [`ScenarioLoader`]: turns a scenario document into an [`ExecutablePipeline`]
//! - [`ExecutablePipeline`]: the step loop with persistence and debug policy
//! - [`PipelineRunner`]: task creation, debug sessions and the version lifecycle
//! - [`Storage`]: the persistence contract, with [`InMemoryStorage`]
//!
//! ### Integrations
//! Retrying HTTP client with per-call metrics, a generic read-through cache and
//! the cached catalog services (identity, calendar, delegation, workgroup).
//!
//! ### SLA
//! Work-hour arithmetic over a calendar (see [`sla`]).
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the internal
//! module structure. Instead of `use pipeliner::engine::store::VariableStore`,
//! users can write `use pipeliner::VariableStore`.

// Core domain models (scenarios, versions, tasks, steps, calendars)
pub mod models;

// Scenario runtime: store, blocks, loader, engine, storage contract
pub mod engine;

// External collaborators: HTTP client, metrics, caches, catalog services
pub mod integrations;

// Work-hour deadline arithmetic
pub mod sla;

// Application configuration (YAML + environment)
pub mod config;

// HTTP surface (axum)
pub mod api;

pub use models::{
    BlockDescriptor, CalendarDayType, CalendarDays, DebugAction, FunctionValue, PipelineBody,
    Scenario, ScenarioStatus, Step, StepStatus, Task, TaskCompletionInterval, TaskStatus, Version,
    VersionStatus,
};

pub use engine::{
    block::{Block, BlockModel, BlockUpdateData, RunContext},
    loader::ScenarioLoader,
    pipeline::{DebugPolicy, ExecutablePipeline, RunOutcome},
    runner::PipelineRunner,
    storage::{InMemoryStorage, Storage},
    store::{StopPoints, StoreSnapshot, VariableStore},
};

pub use config::AppConfig;

use thiserror::Error;

/// Every failure the runtime and its HTTP surface can report
///
/// The first group mirrors the error codes the API exposes through the
/// response envelope; the second group is raised by the runtime itself and
/// is folded into `PipelineExecution` or `PipelineRun` at the API boundary.
///
/// ## Rust Learning Notes:
///
/// ### The `thiserror` Crate
/// - `#[derive(Error)]` implements the `std::error::Error` trait
/// - `#[error("...")]` provides human-readable error messages
/// - `#[from]` enables automatic conversion from other error types with `?`
#[derive(Error, Debug)]
pub enum PipelinerError {
    #[error("can't read request body: {0}")]
    RequestRead(String),

    #[error("can't parse uuid: {0}")]
    UuidParsing(String),

    #[error("can't parse pipeline: {0}")]
    PipelineParse(String),

    #[error("pipeline version is a draft: {0}")]
    PipelineIsDraft(String),

    #[error("pipeline already has a draft: {0}")]
    PipelineHasDraft(String),

    #[error("pipeline name is already used: {0}")]
    PipelineNameUsed(String),

    #[error("can't get pipeline: {0}")]
    GetPipeline(String),

    #[error("can't get version: {0}")]
    GetVersion(String),

    #[error("can't get task: {0}")]
    GetTask(String),

    #[error("can't get tasks: {0}")]
    GetTasks(String),

    #[error("can't create pipeline: {0}")]
    PipelineCreate(String),

    #[error("can't write pipeline: {0}")]
    PipelineWrite(String),

    #[error("can't delete pipeline: {0}")]
    PipelineDelete(String),

    #[error("can't approve version: {0}")]
    Approve(String),

    #[error("can't run pipeline: {0}")]
    PipelineRun(String),

    #[error("error while executing pipeline: {0}")]
    PipelineExecution(String),

    #[error("can't grab pipeline output: {0}")]
    PipelineOutputGrab(String),

    #[error("can't check module usage: {0}")]
    ModuleUsage(String),

    #[error("can't attach tag: {0}")]
    TagAttach(String),

    #[error("can't detach tag: {0}")]
    TagDetach(String),

    #[error("can't get tag: {0}")]
    GetTag(String),

    #[error("scheduler client error: {0}")]
    SchedulerClient(String),

    #[error("network monitor client error: {0}")]
    NetworkMonitorClient(String),

    #[error("auth service error: {0}")]
    AuthService(String),

    #[error("unauthorized")]
    Unauth,

    #[error("no user in context")]
    NoUserInContext,

    #[error("not implemented yet")]
    Teapot,

    #[error("unknown error: {0}")]
    Unknown(String),

    // Runtime kinds

    /// Store lookup of a key nobody wrote
    #[error("unknown key in store: {0}")]
    UnknownKey(String),

    /// Store value exists but has another type than the block expects
    #[error("value of {key} is not a {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("unknown block type: {0}")]
    UnknownBlockType(String),

    #[error("entrypoint {0} is not present in blocks")]
    MissingEntrypoint(String),

    #[error("block {block} points to unknown successor {successor}")]
    UnknownSuccessor { block: String, successor: String },

    #[error("step budget of {0} exceeded")]
    StepBudgetExceeded(usize),

    #[error("sub-pipeline nesting depth {0} exceeded")]
    RecursionLimit(usize),

    #[error("task was cancelled")]
    Cancelled,

    /// Upstream integration failed after retries (or answered with a bad status)
    #[error("integration {system} failed: {message}")]
    Integration { system: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Storage backends report through anyhow for flexible context chains
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for PipelinerError {
    fn from(err: std::io::Error) -> Self {
        PipelinerError::Internal(err.to_string())
    }
}

impl From<::config::ConfigError> for PipelinerError {
    fn from(err: ::config::ConfigError) -> Self {
        PipelinerError::Config(err.to_string())
    }
}

impl From<uuid::Error> for PipelinerError {
    fn from(err: uuid::Error) -> Self {
        PipelinerError::UuidParsing(err.to_string())
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, PipelinerError>;
