// Executable pipeline - the step loop with persistence and debug policy

//! # Executable Pipeline
//!
//! An [`ExecutablePipeline`] is a scenario turned into live blocks. One call
//! to [`ExecutablePipeline::execute`] walks the graph from a start block:
//!
//! ```text
//! loop:
//!   cancelled?           → error
//!   step budget spent?   → error
//!   breakpoint (debug)?  → persist a paused step, stop
//!   append step (running, pre-run snapshot)
//!   block.run
//!   finish step (post-run snapshot, outcome)
//!   next ← block.next   (none → finished)
//! ```
//!
//! ## Persistence Ordering
//!
//! A step record is written before its block runs and completed after, so a
//! crashed task still shows where it was. The task reaches `finished` or
//! `error` exactly once, when the loop ends.
//!
//! ## Debug Policy
//!
//! Blocks know nothing about debugging. [`DebugPolicy`] is applied between
//! blocks: `StepOver` runs exactly one block, `Resume` runs until a
//! breakpoint, `None` ignores breakpoints.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use super::block::{Block, BlockModel, RunContext};
use super::storage::StepUpdate;
use super::store::VariableStore;
use crate::models::{DebugAction, FunctionValue, NewStep, Scenario, StepStatus, TaskStatus};
use crate::{PipelinerError, Result};

pub const DEFAULT_MAX_STEPS: usize = 10_000;
pub const DEFAULT_MAX_DEPTH: usize = 16;

/// Runtime guards of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    /// Step records a single task may write
    pub max_steps: usize,
    /// Sub-pipeline nesting allowed below a top-level task
    pub max_depth: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugPolicy {
    /// Production run, breakpoints are ignored
    None,
    StepOver,
    Resume,
}

impl From<DebugAction> for DebugPolicy {
    fn from(action: DebugAction) -> Self {
        match action {
            DebugAction::StepOver => DebugPolicy::StepOver,
            DebugAction::Resume => DebugPolicy::Resume,
        }
    }
}

/// How a call to `execute` ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunOutcome {
    Finished,
    /// Stopped before running a breakpoint block
    Paused { at: String },
    /// One block ran under `StepOver`; `next` is where the session continues
    Stepped { next: Option<String> },
}

/// Where the loop starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPoint {
    pub block: String,
    /// Index of the next step record of the task
    pub next_index: u64,
    /// Do not pause at the start block even if it is a breakpoint
    pub skip_first_break: bool,
}

impl StartPoint {
    pub fn at(block: impl Into<String>) -> Self {
        Self {
            block: block.into(),
            next_index: 0,
            skip_first_break: false,
        }
    }
}

pub struct ExecutablePipeline {
    pipeline_id: Uuid,
    version_id: Uuid,
    name: String,
    entrypoint: String,
    blocks: BTreeMap<String, Box<dyn Block>>,
    input: Vec<FunctionValue>,
    output: Vec<FunctionValue>,
}

impl std::fmt::Debug for ExecutablePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutablePipeline")
            .field("pipeline_id", &self.pipeline_id)
            .field("version_id", &self.version_id)
            .field("name", &self.name)
            .field("entrypoint", &self.entrypoint)
            .field("blocks", &self.blocks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutablePipeline {
    pub fn new(scenario: &Scenario, blocks: BTreeMap<String, Box<dyn Block>>) -> Self {
        Self {
            pipeline_id: scenario.id,
            version_id: scenario.version_id,
            name: scenario.name.clone(),
            entrypoint: scenario.pipeline.entrypoint.clone(),
            blocks,
            input: scenario.input.clone(),
            output: scenario.output.clone(),
        }
    }

    pub fn pipeline_id(&self) -> Uuid {
        self.pipeline_id
    }

    pub fn version_id(&self) -> Uuid {
        self.version_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    pub fn input(&self) -> &[FunctionValue] {
        &self.input
    }

    pub fn has_block(&self, name: &str) -> bool {
        self.blocks.contains_key(name)
    }

    pub fn models(&self) -> BTreeMap<String, BlockModel> {
        self.blocks
            .iter()
            .map(|(name, block)| (name.clone(), block.model()))
            .collect()
    }

    /// Seed `<scenarioName>.<param>` for every key of the parameter object
    pub fn seed_store(&self, store: &VariableStore, parameters: &Value) {
        if let Value::Object(params) = parameters {
            for (key, value) in params {
                store.set(&format!("{}.{}", self.name, key), value.clone());
            }
        }
    }

    /// Private state of every stateful block
    pub fn states(&self) -> BTreeMap<String, Value> {
        self.blocks
            .iter()
            .filter_map(|(name, block)| block.state().map(|s| (name.clone(), s)))
            .collect()
    }

    /// Put recorded block states back; unknown block names are ignored
    pub fn restore_states(&mut self, states: &BTreeMap<String, Value>) -> Result<()> {
        for (name, state) in states {
            if let Some(block) = self.blocks.get_mut(name) {
                block.set_state(state)?;
            }
        }
        Ok(())
    }

    /// Successor of `block` as it would be computed now
    pub fn next_of(&self, block: &str, store: &VariableStore) -> Option<String> {
        self.blocks.get(block).and_then(|b| b.next(store))
    }

    /// Resolve the scenario outputs against the final store
    pub fn grab_output(&self, store: &VariableStore) -> Result<Map<String, Value>> {
        let mut output = Map::new();
        for out in &self.output {
            let global = out.global.as_deref().ok_or_else(|| {
                PipelinerError::PipelineOutputGrab(format!("output {} has no global key", out.name))
            })?;
            let value = store.get(global).ok_or_else(|| {
                PipelinerError::PipelineOutputGrab(format!("no value for output {} ({})", out.name, global))
            })?;
            output.insert(out.name.clone(), value);
        }
        Ok(output)
    }

    /// Run a task straight through from the entrypoint
    pub async fn run(&mut self, ctx: &RunContext, store: &VariableStore) -> Result<()> {
        let start = StartPoint::at(self.entrypoint.clone());
        self.execute(ctx, store, DebugPolicy::None, start).await.map(|_| ())
    }

    /// The step loop
    #[instrument(skip_all, fields(task_id = %ctx.task_id, pipeline = %self.name, policy = ?policy))]
    pub async fn execute(
        &mut self,
        ctx: &RunContext,
        store: &VariableStore,
        policy: DebugPolicy,
        start: StartPoint,
    ) -> Result<RunOutcome> {
        ctx.storage.update_task_status(ctx.task_id, TaskStatus::Running).await?;

        let mut current = start.block;
        let mut index = start.next_index;
        let mut skip_break = start.skip_first_break;

        loop {
            if ctx.cancel.is_cancelled() {
                return self.fail(ctx, store, PipelinerError::Cancelled).await;
            }
            if index as usize >= ctx.limits.max_steps {
                return self
                    .fail(ctx, store, PipelinerError::StepBudgetExceeded(ctx.limits.max_steps))
                    .await;
            }

            let block_type = match self.blocks.get(&current) {
                Some(block) => block.block_type().to_string(),
                None => {
                    // Unknown successors end the task like an empty one
                    warn!(block = %current, "successor is not a block of the pipeline, finishing");
                    return self.finish(ctx).await;
                }
            };

            if policy != DebugPolicy::None && !skip_break && store.is_break_point(&current) {
                let paused = NewStep {
                    task_id: ctx.task_id,
                    index,
                    block_name: current.clone(),
                    block_type,
                    status: StepStatus::Paused,
                    started_at: Utc::now(),
                    state: self.states(),
                    snapshot: store.snapshot(),
                    break_points: store.break_points(),
                    error: None,
                };
                if let Err(e) = ctx.storage.append_step(paused).await {
                    return self.fail(ctx, store, e).await;
                }
                if let Err(e) = ctx.storage.update_task_status(ctx.task_id, TaskStatus::Stopped).await {
                    return self.fail(ctx, store, e).await;
                }
                info!(block = %current, "paused on breakpoint");
                return Ok(RunOutcome::Paused { at: current });
            }
            skip_break = false;

            let appended = ctx
                .storage
                .append_step(NewStep {
                    task_id: ctx.task_id,
                    index,
                    block_name: current.clone(),
                    block_type,
                    status: StepStatus::Running,
                    started_at: Utc::now(),
                    state: self.states(),
                    snapshot: store.snapshot(),
                    break_points: store.break_points(),
                    error: None,
                })
                .await;
            let step_id = match appended {
                Ok(step_id) => step_id,
                Err(e) => return self.fail(ctx, store, e).await,
            };
            index += 1;
            store.add_step(&current);

            let span = info_span!("step", block = %current, step = index - 1);
            let outcome = {
                let block = match self.blocks.get_mut(&current) {
                    Some(block) => block,
                    None => {
                        let e = PipelinerError::Internal(format!("block {} vanished from the pipeline", current));
                        return self.fail(ctx, store, e).await;
                    }
                };
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(PipelinerError::Cancelled),
                    res = block.run(ctx, store).instrument(span) => res,
                }
            };

            if let Err(e) = outcome {
                error!(block = %current, error = %e, "block failed");
                store.add_error(&e);
                let update = StepUpdate {
                    finished_at: Utc::now(),
                    status: StepStatus::Error,
                    state: self.states(),
                    snapshot: store.snapshot(),
                    error: Some(e.to_string()),
                };
                if let Err(persist) = ctx.storage.finish_step(step_id, update).await {
                    warn!(error = %persist, "failed step could not be recorded");
                }
                ctx.storage.update_task_status(ctx.task_id, TaskStatus::Error).await?;
                return Err(e);
            }

            let update = StepUpdate {
                finished_at: Utc::now(),
                status: StepStatus::Finished,
                state: self.states(),
                snapshot: store.snapshot(),
                error: None,
            };
            if let Err(e) = ctx.storage.finish_step(step_id, update).await {
                return self.fail(ctx, store, e).await;
            }

            let next = self.next_of(&current, store);
            debug!(block = %current, next = ?next, "step done");

            if policy == DebugPolicy::StepOver {
                store.mark_stepped_over(&current);
                if next.is_none() {
                    return self.finish(ctx).await;
                }
                if let Err(e) = ctx.storage.update_task_status(ctx.task_id, TaskStatus::Stopped).await {
                    return self.fail(ctx, store, e).await;
                }
                return Ok(RunOutcome::Stepped { next });
            }

            match next {
                Some(next) => current = next,
                None => return self.finish(ctx).await,
            }
        }
    }

    async fn finish(&self, ctx: &RunContext) -> Result<RunOutcome> {
        ctx.storage.update_task_status(ctx.task_id, TaskStatus::Finished).await?;
        info!(task_id = %ctx.task_id, "task finished");
        Ok(RunOutcome::Finished)
    }

    async fn fail(&self, ctx: &RunContext, store: &VariableStore, e: PipelinerError) -> Result<RunOutcome> {
        error!(task_id = %ctx.task_id, error = %e, "task failed");
        store.add_error(&e);
        ctx.storage.update_task_status(ctx.task_id, TaskStatus::Error).await?;
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loader::ScenarioLoader;
    use crate::engine::storage::{InMemoryStorage, Storage};
    use crate::engine::test_support::{create_test_loader, scenario_from};
    use crate::models::Task;
    use serde_json::json;
    use std::sync::Arc;

    /// If → (true) Vars → end, (false) end; a `for` over `S.items` with `Vars` as body
    fn create_test_scenario() -> Scenario {
        scenario_from(json!({
            "id": Uuid::new_v4(), "version_id": Uuid::new_v4(), "name": "S", "status": 2,
            "input": [], "output": [ { "name": "copy", "type": "string", "global": "Vars.copy" } ],
            "pipeline": {
                "entrypoint": "For",
                "blocks": {
                    "For": {
                        "block_type": "internal", "title": "for",
                        "input": [ { "name": "iter", "type": "array", "global": "S.items" } ],
                        "output": [ { "name": "now_on", "type": "string", "global": "For.now_on" } ],
                        "body": "Vars", "after": "If"
                    },
                    "Vars": {
                        "block_type": "internal", "title": "vars",
                        "input": [ { "name": "copy", "type": "string", "global": "For.now_on" } ],
                        "output": [ { "name": "copy", "type": "string", "global": "Vars.copy" } ],
                        "next": "For"
                    },
                    "If": {
                        "block_type": "internal", "title": "if",
                        "input": [ { "name": "check", "type": "boolean", "global": "S.flag" } ],
                        "on_true": "", "on_false": ""
                    }
                }
            }
        }))
    }

    async fn create_test_run(
        loader: &ScenarioLoader,
        storage: Arc<InMemoryStorage>,
        limits: EngineLimits,
    ) -> (ExecutablePipeline, RunContext, VariableStore) {
        let scenario = create_test_scenario();
        let pipeline = loader.build(&scenario).unwrap();
        let task = storage
            .create_task(Task::new(scenario.version_id, "tester", false, json!({})))
            .await
            .unwrap();
        let ctx = RunContext::new(storage, loader.clone(), task.id, "tester", limits);
        let store = VariableStore::new();
        pipeline.seed_store(&store, &json!({ "items": ["a", "b"], "flag": true }));
        (pipeline, ctx, store)
    }

    #[tokio::test]
    async fn test_straight_run_records_dense_steps() {
        let storage = Arc::new(InMemoryStorage::new());
        let (mut pipeline, ctx, store) = create_test_run(&create_test_loader(), storage.clone(), EngineLimits::default()).await;

        pipeline.run(&ctx, &store).await.unwrap();

        let steps = storage.get_task_steps(ctx.task_id).await.unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.block_name.as_str()).collect();
        assert_eq!(names, vec!["For", "Vars", "For", "Vars", "For", "If"]);
        assert!(steps.iter().enumerate().all(|(i, s)| s.index == i as u64));
        assert!(steps.iter().all(|s| s.status == StepStatus::Finished));

        let task = storage.get_task(ctx.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Finished);
        assert_eq!(pipeline.grab_output(&store).unwrap()["copy"], "b");
    }

    #[tokio::test]
    async fn test_step_budget_fails_the_task() {
        let storage = Arc::new(InMemoryStorage::new());
        let limits = EngineLimits {
            max_steps: 3,
            max_depth: 1,
        };
        let (mut pipeline, ctx, store) = create_test_run(&create_test_loader(), storage.clone(), limits).await;

        let err = pipeline.run(&ctx, &store).await.unwrap_err();
        assert!(matches!(err, PipelinerError::StepBudgetExceeded(3)));
        assert_eq!(storage.get_task_steps(ctx.task_id).await.unwrap().len(), 3);
        let task = storage.get_task(ctx.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(store.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_block_error_marks_step_and_task() {
        let storage = Arc::new(InMemoryStorage::new());
        let (mut pipeline, ctx, store) = create_test_run(&create_test_loader(), storage.clone(), EngineLimits::default()).await;
        store.set("S.flag", json!("not a bool"));

        assert!(pipeline.run(&ctx, &store).await.is_err());
        let steps = storage.get_task_steps(ctx.task_id).await.unwrap();
        let last = steps.last().unwrap();
        assert_eq!(last.block_name, "If");
        assert_eq!(last.status, StepStatus::Error);
        assert!(last.error.is_some());
        assert_eq!(storage.get_task(ctx.task_id).await.unwrap().unwrap().status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_cancelled_task_stops_before_next_block() {
        let storage = Arc::new(InMemoryStorage::new());
        let (mut pipeline, ctx, store) = create_test_run(&create_test_loader(), storage.clone(), EngineLimits::default()).await;
        ctx.cancel.cancel();

        let err = pipeline.run(&ctx, &store).await.unwrap_err();
        assert!(matches!(err, PipelinerError::Cancelled));
        assert!(storage.get_task_steps(ctx.task_id).await.unwrap().is_empty());
        assert_eq!(storage.get_task(ctx.task_id).await.unwrap().unwrap().status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_breakpoint_pauses_and_step_over_stops() {
        let storage = Arc::new(InMemoryStorage::new());
        let (mut pipeline, ctx, store) = create_test_run(&create_test_loader(), storage.clone(), EngineLimits::default()).await;
        let mut points = crate::engine::store::StopPoints::new("For");
        points.set_break_points(["Vars"]);
        store.set_stop_points(points);

        let outcome = pipeline
            .execute(&ctx, &store, DebugPolicy::Resume, StartPoint::at("For"))
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Paused { at: "Vars".to_string() });

        let steps = storage.get_task_steps(ctx.task_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].status, StepStatus::Paused);
        assert_eq!(storage.get_task(ctx.task_id).await.unwrap().unwrap().status, TaskStatus::Stopped);

        let start = StartPoint {
            block: "Vars".to_string(),
            next_index: 2,
            skip_first_break: true,
        };
        let outcome = pipeline.execute(&ctx, &store, DebugPolicy::StepOver, start).await.unwrap();
        assert_eq!(outcome, RunOutcome::Stepped { next: Some("For".to_string()) });
        assert_eq!(store.get("Vars.copy"), Some(json!("a")));
    }

    #[tokio::test]
    async fn test_rejected_step_append_fails_the_task() {
        let storage = Arc::new(InMemoryStorage::new());
        let (mut pipeline, ctx, store) = create_test_run(&create_test_loader(), storage.clone(), EngineLimits::default()).await;
        let start = StartPoint {
            block: "For".to_string(),
            next_index: 5,
            skip_first_break: false,
        };

        assert!(pipeline.execute(&ctx, &store, DebugPolicy::None, start).await.is_err());
        assert!(storage.get_task_steps(ctx.task_id).await.unwrap().is_empty());
        assert_eq!(storage.get_task(ctx.task_id).await.unwrap().unwrap().status, TaskStatus::Error);
        assert_eq!(store.errors().len(), 1);
    }
}
