// Scenario block - runs another approved scenario as a nested task

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{default_next, edge, model, BlockHeader, SHAPE_SCENARIO, TYPE_SCENARIO};
use crate::engine::block::{Block, BlockModel, RunContext};
use crate::engine::store::VariableStore;
use crate::models::{BlockDescriptor, Task};
use crate::{PipelinerError, Result};

/// Nested pipeline named by the block title
///
/// The sub-scenario gets its own task (with `parent_task` set) and its own
/// store, seeded as `<subName>.<input>` from the parent's input aliases.
/// After it finishes, each sub-scenario output whose name is one of this
/// block's outputs is copied back to the parent store.
pub struct ScenarioBlock {
    header: BlockHeader,
    next: Option<String>,
    sub_task: Option<Uuid>,
}

impl ScenarioBlock {
    pub fn new(name: &str, descriptor: &BlockDescriptor) -> Self {
        Self {
            header: BlockHeader::from_descriptor(name, descriptor),
            next: edge(&descriptor.next),
            sub_task: None,
        }
    }

    pub fn registered_model() -> BlockModel {
        model(TYPE_SCENARIO, "scenario", Vec::new(), Vec::new(), default_next(), SHAPE_SCENARIO)
    }

    pub fn sub_task(&self) -> Option<Uuid> {
        self.sub_task
    }
}

#[async_trait]
impl Block for ScenarioBlock {
    fn name(&self) -> &str {
        &self.header.name
    }

    fn block_type(&self) -> &str {
        &self.header.block_type
    }

    fn inputs(&self) -> &BTreeMap<String, String> {
        &self.header.inputs
    }

    fn outputs(&self) -> &BTreeMap<String, String> {
        &self.header.outputs
    }

    fn model(&self) -> BlockModel {
        let mut model = Self::registered_model();
        model.title = self.header.title.clone();
        model
    }

    #[instrument(skip_all, fields(block = %self.header.name, scenario = %self.header.title, depth = ctx.depth))]
    async fn run(&mut self, ctx: &RunContext, store: &VariableStore) -> Result<()> {
        if ctx.depth + 1 > ctx.limits.max_depth {
            return Err(PipelinerError::RecursionLimit(ctx.limits.max_depth));
        }

        let scenario = ctx
            .storage
            .get_executable_by_name(&self.header.title)
            .await?
            .ok_or_else(|| PipelinerError::NotFound(format!("approved scenario {}", self.header.title)))?;
        let mut pipeline = ctx.loader.build(&scenario)?;

        let sub_store = VariableStore::new();
        let mut parameters = Map::new();
        for (local, alias) in &self.header.inputs {
            if let Some(value) = store.get(alias) {
                sub_store.set(&scenario.param_key(local), value.clone());
                parameters.insert(local.clone(), value);
            }
        }

        let mut task = Task::new(scenario.version_id, ctx.author.clone(), false, Value::Object(parameters));
        task.parent_task = Some(ctx.task_id);
        let task = ctx.storage.create_task(task).await?;
        self.sub_task = Some(task.id);
        info!(sub_task = %task.id, "sub-pipeline started");

        let sub_ctx = ctx.nested(task.id);
        Box::pin(pipeline.run(&sub_ctx, &sub_store)).await?;

        for out in &scenario.output {
            let (Some(global), Some(target)) = (&out.global, self.header.outputs.get(&out.name)) else {
                continue;
            };
            store.set(target, sub_store.get(global).unwrap_or(Value::Null));
        }
        Ok(())
    }

    fn next(&self, _store: &VariableStore) -> Option<String> {
        self.next.clone()
    }

    fn state(&self) -> Option<Value> {
        self.sub_task.map(|id| json!({ "sub_task_id": id }))
    }

    fn set_state(&mut self, state: &Value) -> Result<()> {
        self.sub_task = match state.get("sub_task_id") {
            Some(id) => Some(serde_json::from_value(id.clone())?),
            None => None,
        };
        Ok(())
    }

    fn is_scenario(&self) -> bool {
        true
    }
}
