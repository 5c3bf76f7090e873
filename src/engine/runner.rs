// Pipeline runner - task creation, debug sessions and the version lifecycle

//! # Pipeline Runner
//!
//! The runner is what the HTTP layer talks to. It owns the collaborators a
//! run needs (storage, loader, catalog services, limits) and turns requests
//! into tasks:
//!
//! - **Runs**: `run_pipeline` / `run_version` create a task, seed a store and
//!   execute the pipeline, either detached (async) or awaited by the caller (sync)
//! - **Debug sessions**: `create_debug_task` + `debug_run` resume a task from
//!   its last step record with a [`DebugPolicy`]
//! - **Lifecycle**: pipeline and version CRUD over [`Storage`]
//!
//! ## Rust Learning Notes:
//!
//! ### Detached runs
//! `tokio::spawn` requires a `'static` future, so an async run moves owned
//! clones (`Arc` storage, cloned loader and context) into the task. Nothing
//! borrowed from the request survives the handler.
//!
//! Sync runs are spawned the same way and the caller awaits the `JoinHandle`,
//! handing the pipeline and store back through its output. Dropping the caller
//! drops only the handle; the run keeps going until the call token cancels it.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::block::{BlockModel, RunContext};
use super::loader::{self, ScenarioLoader};
use super::pipeline::{DebugPolicy, EngineLimits, ExecutablePipeline, RunOutcome, StartPoint};
use super::storage::{PipelineRecord, Storage};
use super::store::{StopPoints, VariableStore};
use crate::integrations::http::CallContext;
use crate::integrations::{ProbeResult, Services};
use crate::models::{DebugAction, Scenario, Step, StepStatus, Task, TaskStatus, Version, VersionStatus};
use crate::{PipelinerError, Result};

/// Whether the caller waits for the task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Async,
    /// Run in the caller and return the outputs (`with_stop=true`)
    Sync,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResponse {
    pub pipeline_id: Uuid,
    pub version_id: Uuid,
    pub task_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_number: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugResult {
    pub task: Task,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskWithSteps {
    #[serde(flatten)]
    pub task: Task,
    pub steps: Vec<Step>,
}

/// Hook run before a pipeline is deleted (scheduler jobs, network monitor subscriptions)
#[async_trait]
pub trait CleanupHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_pipeline_delete(&self, pipeline_id: Uuid, ctx: &CallContext) -> Result<()>;
}

#[derive(Clone)]
pub struct PipelineRunner {
    storage: Arc<dyn Storage>,
    loader: ScenarioLoader,
    services: Services,
    limits: EngineLimits,
    cleanup_hooks: Vec<Arc<dyn CleanupHook>>,
    running: Arc<DashMap<Uuid, CancellationToken>>,
}

impl PipelineRunner {
    pub fn new(storage: Arc<dyn Storage>, loader: ScenarioLoader, services: Services, limits: EngineLimits) -> Self {
        Self {
            storage,
            loader,
            services,
            limits,
            cleanup_hooks: Vec::new(),
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn with_cleanup_hook(mut self, hook: Arc<dyn CleanupHook>) -> Self {
        self.cleanup_hooks.push(hook);
        self
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    pub fn loader(&self) -> &ScenarioLoader {
        &self.loader
    }

    pub fn limits(&self) -> EngineLimits {
        self.limits
    }

    // Runs

    /// Run the current approved version of a pipeline
    #[instrument(skip(self, parameters, call), fields(request_id = %call.request_id))]
    pub async fn run_pipeline(
        &self,
        pipeline_id: Uuid,
        parameters: Value,
        author: &str,
        mode: RunMode,
        call: &CallContext,
    ) -> Result<RunResponse> {
        let scenario = self
            .storage
            .get_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| PipelinerError::GetPipeline(format!("no approved version of {}", pipeline_id)))?;
        self.run_scenario(scenario, parameters, author, mode, call).await
    }

    /// Run a specific version, drafts included
    #[instrument(skip(self, parameters, call), fields(request_id = %call.request_id))]
    pub async fn run_version(
        &self,
        version_id: Uuid,
        parameters: Value,
        author: &str,
        mode: RunMode,
        call: &CallContext,
    ) -> Result<RunResponse> {
        let version = self.get_version(version_id).await?;
        if version.status == VersionStatus::Deleted {
            return Err(PipelinerError::GetVersion(format!("version {} is deleted", version_id)));
        }
        self.run_scenario(version.content, parameters, author, mode, call).await
    }

    async fn run_scenario(
        &self,
        scenario: Scenario,
        parameters: Value,
        author: &str,
        mode: RunMode,
        call: &CallContext,
    ) -> Result<RunResponse> {
        let mut pipeline = self
            .loader
            .build(&scenario)
            .map_err(|e| PipelinerError::PipelineRun(e.to_string()))?;

        let mut task = Task::new(scenario.version_id, author, false, parameters.clone());
        task.work_number = self.next_work_number(call).await;
        let task = self
            .storage
            .create_task(task)
            .await
            .map_err(|e| PipelinerError::PipelineRun(e.to_string()))?;
        info!(task_id = %task.id, pipeline = %scenario.name, ?mode, "task created");

        let cancel = match mode {
            RunMode::Sync => call.cancel.child_token(),
            RunMode::Async => CancellationToken::new(),
        };
        let ctx = RunContext::new(self.storage.clone(), self.loader.clone(), task.id, author, self.limits)
            .with_cancel(cancel.clone())
            .with_request_id(call.request_id.clone());
        let store = VariableStore::new();
        pipeline.seed_store(&store, &parameters);

        let mut response = RunResponse {
            pipeline_id: scenario.id,
            version_id: scenario.version_id,
            task_id: task.id,
            work_number: task.work_number.clone(),
            status: task.status,
            output: None,
        };

        match mode {
            RunMode::Sync => {
                // The run lives on its own task; dropping the caller only cancels it
                self.running.insert(task.id, cancel);
                let running = self.running.clone();
                let handle = tokio::spawn(async move {
                    let outcome = pipeline.run(&ctx, &store).await;
                    running.remove(&ctx.task_id);
                    outcome.map(|_| (pipeline, store))
                });
                let (pipeline, store) = handle
                    .await
                    .map_err(|e| PipelinerError::Internal(format!("pipeline run aborted: {}", e)))?
                    .map_err(|e| PipelinerError::PipelineExecution(e.to_string()))?;

                response.status = TaskStatus::Finished;
                response.output = Some(pipeline.grab_output(&store)?);
            }
            RunMode::Async => {
                self.running.insert(task.id, cancel);
                let running = self.running.clone();
                tokio::spawn(async move {
                    if let Err(e) = pipeline.run(&ctx, &store).await {
                        error!(task_id = %ctx.task_id, error = %e, "error while executing pipeline");
                    }
                    running.remove(&ctx.task_id);
                });
            }
        }
        Ok(response)
    }

    async fn next_work_number(&self, call: &CallContext) -> Option<String> {
        let sequence = self.services.sequence.as_ref()?;
        match sequence.next_work_number(call).await {
            Ok(number) => Some(number),
            Err(e) => {
                warn!(error = %e, "no work number, task proceeds without one");
                None
            }
        }
    }

    /// Cancel a task running in this process
    pub fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        let token = self
            .running
            .get(&task_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| PipelinerError::GetTask(format!("task {} is not running", task_id)))?;
        token.cancel();
        info!(%task_id, "task cancellation requested");
        Ok(())
    }

    // Debug sessions

    pub async fn create_debug_task(&self, version_id: Uuid, parameters: Value, author: &str) -> Result<Task> {
        let version = self.get_version(version_id).await?;
        let task = Task::new(version.version_id, author, true, parameters);
        self.storage.create_task(task).await
    }

    /// Continue a debug task from its last step record
    #[instrument(skip(self, break_points, call), fields(request_id = %call.request_id))]
    pub async fn debug_run(
        &self,
        task_id: Uuid,
        break_points: Vec<String>,
        action: DebugAction,
        call: &CallContext,
    ) -> Result<DebugResult> {
        let task = self.get_task(task_id).await?;
        match task.status {
            TaskStatus::Created | TaskStatus::Stopped => {}
            TaskStatus::Running => return Err(PipelinerError::PipelineRun("task is already running".to_string())),
            TaskStatus::Error => return Err(PipelinerError::PipelineRun("task has failed".to_string())),
            TaskStatus::Finished => return Err(PipelinerError::PipelineRun("task is finished".to_string())),
        }

        let version = self.get_version(task.version_id).await?;
        let mut pipeline = self
            .loader
            .build(&version.content)
            .map_err(|e| PipelinerError::PipelineRun(e.to_string()))?;
        let steps = self.storage.get_task_steps(task_id).await?;
        let break_points: BTreeSet<String> = break_points.into_iter().collect();

        let (store, start) = match steps.last() {
            None => {
                let store = VariableStore::new();
                pipeline.seed_store(&store, &task.parameters);
                let mut points = StopPoints::new(pipeline.entrypoint());
                points.set_break_points(break_points.iter().cloned());
                store.set_stop_points(points);
                (store, StartPoint::at(pipeline.entrypoint()))
            }
            Some(last) => match restore(&mut pipeline, last, &break_points)? {
                Restored::Continue(store, start) => (store, start),
                Restored::Done => {
                    self.storage.update_task_status(task_id, TaskStatus::Finished).await?;
                    let task = self.get_task(task_id).await?;
                    return Ok(DebugResult {
                        task,
                        outcome: RunOutcome::Finished,
                    });
                }
            },
        };

        let ctx = RunContext::new(self.storage.clone(), self.loader.clone(), task_id, task.author.clone(), self.limits)
            .with_cancel(call.cancel.child_token())
            .with_request_id(call.request_id.clone());
        let policy = DebugPolicy::from(action);
        let handle = tokio::spawn(async move { pipeline.execute(&ctx, &store, policy, start).await });
        let outcome = handle
            .await
            .map_err(|e| PipelinerError::Internal(format!("debug run aborted: {}", e)))?
            .map_err(|e| PipelinerError::PipelineExecution(e.to_string()))?;
        info!(%task_id, ?outcome, "debug run stopped");

        Ok(DebugResult {
            task: self.get_task(task_id).await?,
            outcome,
        })
    }

    // Reads

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.storage
            .get_task(task_id)
            .await?
            .ok_or_else(|| PipelinerError::GetTask(format!("no task {}", task_id)))
    }

    pub async fn get_task_with_steps(&self, task_id: Uuid) -> Result<TaskWithSteps> {
        let task = self.get_task(task_id).await?;
        let steps = self.storage.get_task_steps(task_id).await?;
        Ok(TaskWithSteps { task, steps })
    }

    pub async fn list_tasks(&self, version_id: Option<Uuid>) -> Result<Vec<Task>> {
        self.storage
            .list_tasks(version_id)
            .await
            .map_err(|e| PipelinerError::GetTasks(e.to_string()))
    }

    pub async fn get_pipeline(&self, pipeline_id: Uuid) -> Result<Scenario> {
        self.storage
            .get_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| PipelinerError::GetPipeline(format!("no approved version of {}", pipeline_id)))
    }

    pub async fn get_version(&self, version_id: Uuid) -> Result<Version> {
        self.storage
            .get_pipeline_version(version_id)
            .await?
            .ok_or_else(|| PipelinerError::GetVersion(format!("no version {}", version_id)))
    }

    pub async fn list_versions(&self, pipeline_id: Uuid) -> Result<Vec<Version>> {
        self.storage.list_versions(pipeline_id).await
    }

    pub async fn versions_by_status(&self, status: VersionStatus, author: Option<&str>) -> Result<Vec<Version>> {
        self.storage.get_versions_by_status(status, author).await
    }

    pub async fn worked_versions(&self) -> Result<Vec<Version>> {
        self.storage.get_worked_versions().await
    }

    /// Models of every block kind, for editors
    pub fn modules(&self) -> Vec<BlockModel> {
        loader::registered_models()
    }

    /// Ping every configured integration
    pub async fn health(&self, call: &CallContext) -> BTreeMap<&'static str, ProbeResult> {
        self.services.ping_all(call).await
    }

    // Lifecycle

    /// Register a new pipeline with the document as its first draft
    pub async fn create_pipeline(&self, mut scenario: Scenario, author: &str) -> Result<Version> {
        loader::validate(&scenario).map_err(|e| PipelinerError::PipelineParse(e.to_string()))?;

        scenario.id = Uuid::new_v4();
        scenario.version_id = Uuid::new_v4();
        scenario.status = VersionStatus::Draft;
        let record = PipelineRecord {
            id: scenario.id,
            name: scenario.name.clone(),
            author: author.to_string(),
            created_at: Utc::now(),
        };
        let draft = Version::new_draft(scenario, author, None);
        self.storage.create_pipeline(record, draft.clone()).await?;
        info!(pipeline_id = %draft.pipeline_id, "pipeline created");
        Ok(draft)
    }

    /// Open a new draft of an existing pipeline, parented on its approved version
    pub async fn create_version(&self, pipeline_id: Uuid, mut scenario: Scenario, author: &str) -> Result<Version> {
        loader::validate(&scenario).map_err(|e| PipelinerError::PipelineParse(e.to_string()))?;

        let parent = self.storage.get_pipeline(pipeline_id).await?.map(|s| s.version_id);
        scenario.id = pipeline_id;
        scenario.version_id = Uuid::new_v4();
        scenario.status = VersionStatus::Draft;
        let draft = Version::new_draft(scenario, author, parent);
        self.storage
            .create_version(draft.clone())
            .await?;
        Ok(draft)
    }

    pub async fn update_draft(&self, scenario: Scenario) -> Result<Version> {
        loader::validate(&scenario).map_err(|e| PipelinerError::PipelineParse(e.to_string()))?;
        self.ensure_editable(scenario.version_id).await?;

        let version_id = scenario.version_id;
        self.storage
            .update_draft(version_id, scenario)
            .await
            .map_err(|e| PipelinerError::PipelineWrite(e.to_string()))?;
        self.get_version(version_id).await
    }

    pub async fn send_to_approve(&self, version_id: Uuid) -> Result<()> {
        self.storage.send_to_approve(version_id).await
    }

    pub async fn approve(&self, version_id: Uuid, author: &str) -> Result<()> {
        let version = self.get_version(version_id).await?;
        self.storage
            .switch_approved(version.pipeline_id, version_id, author)
            .await?;
        info!(%version_id, pipeline_id = %version.pipeline_id, "version approved");
        Ok(())
    }

    /// Reject a version on approve; the pipeline keeps serving its approved version
    pub async fn reject(&self, version_id: Uuid, comment: &str, author: &str) -> Result<()> {
        self.storage.switch_rejected(version_id, comment, author).await
    }

    pub async fn rollback(&self, pipeline_id: Uuid, version_id: Uuid) -> Result<()> {
        self.storage.rollback_version(pipeline_id, version_id).await
    }

    pub async fn delete_version(&self, version_id: Uuid) -> Result<()> {
        self.ensure_editable(version_id).await?;
        self.storage
            .delete_version(version_id)
            .await
            .map_err(|e| PipelinerError::PipelineDelete(e.to_string()))
    }

    /// Run cleanup hooks one after another, then delete
    pub async fn delete_pipeline(&self, pipeline_id: Uuid, call: &CallContext) -> Result<()> {
        for hook in &self.cleanup_hooks {
            hook.on_pipeline_delete(pipeline_id, call).await.map_err(|e| {
                error!(hook = hook.name(), error = %e, "cleanup before delete failed");
                e
            })?;
        }
        self.storage
            .delete_pipeline(pipeline_id)
            .await
            .map_err(|e| PipelinerError::PipelineDelete(e.to_string()))
    }

    async fn ensure_editable(&self, version_id: Uuid) -> Result<()> {
        let version = self.get_version(version_id).await?;
        match version.status {
            VersionStatus::Draft | VersionStatus::Rejected => Ok(()),
            other => Err(PipelinerError::PipelineIsDraft(format!(
                "version {} is not editable in status {:?}",
                version_id, other
            ))),
        }
    }

    // Tags and modules

    pub async fn attach_tag(&self, pipeline_id: Uuid, tag: &str) -> Result<()> {
        self.storage.attach_tag(pipeline_id, tag).await
    }

    pub async fn detach_tag(&self, pipeline_id: Uuid, tag: &str) -> Result<()> {
        self.storage.detach_tag(pipeline_id, tag).await
    }

    pub async fn get_tags(&self, pipeline_id: Uuid) -> Result<Vec<String>> {
        self.storage.get_pipeline_tags(pipeline_id).await
    }

    pub async fn module_usage(&self, module: &str) -> Result<Vec<Uuid>> {
        self.storage
            .pipelines_using_module(module)
            .await
            .map_err(|e| PipelinerError::ModuleUsage(e.to_string()))
    }
}

enum Restored {
    Continue(VariableStore, StartPoint),
    /// The last recorded block had no successor
    Done,
}

/// Rebuild store, block states and start point from the last step record
fn restore(pipeline: &mut ExecutablePipeline, last: &Step, break_points: &BTreeSet<String>) -> Result<Restored> {
    let store = VariableStore::restore_from(last, break_points);
    pipeline.restore_states(&last.state)?;

    let block = match last.status {
        StepStatus::Finished => match pipeline.next_of(&last.block_name, &store) {
            Some(next) => next,
            None => return Ok(Restored::Done),
        },
        StepStatus::Paused | StepStatus::Running => last.block_name.clone(),
        StepStatus::Error => {
            return Err(PipelinerError::PipelineRun(format!(
                "task failed at block {}",
                last.block_name
            )))
        }
    };

    let start = StartPoint {
        block,
        next_index: last.index + 1,
        skip_first_break: true,
    };
    Ok(Restored::Continue(store, start))
}
