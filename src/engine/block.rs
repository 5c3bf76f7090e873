// Block protocol - the contract every executable block satisfies

//! # Block Protocol
//!
//! The engine is block-agnostic: it only knows a map from block name to a
//! `Box<dyn Block>`. Each block describes itself (`model`), exposes its input
//! and output alias maps, runs against the shared [`VariableStore`], names its
//! successor and carries private state that is persisted with every step.
//!
//! ## Run vs Debug
//!
//! Blocks implement `run` only. Debug behaviour (breakpoints, step-over) is a
//! policy of the engine, applied between blocks.
//!
//! ## Rust Learning Notes:
//!
//! ### `&mut self` in an async trait
//! `run` takes `&mut self` so loop counters and sub-task ids can live inside
//! the block. The engine owns its blocks exclusively, so no interior
//! mutability is needed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::loader::ScenarioLoader;
use super::pipeline::EngineLimits;
use super::storage::Storage;
use super::store::VariableStore;
use crate::integrations::http::CallContext;
use crate::{PipelinerError, Result};

/// Typed parameter of a block model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionValueModel {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default)]
    pub comment: String,
}

impl FunctionValueModel {
    pub fn new(name: &str, value_type: &str) -> Self {
        Self {
            name: name.to_string(),
            value_type: value_type.to_string(),
            comment: String::new(),
        }
    }
}

/// Self-description of a block kind, served to editors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockModel {
    pub block_type: String,
    pub title: String,
    pub inputs: Vec<FunctionValueModel>,
    pub outputs: Vec<FunctionValueModel>,
    /// Successor edges the block advertises
    pub next: Vec<String>,
    /// Rendering hint for editors only
    pub shape: String,
}

/// Data pushed into a block from outside the runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockUpdateData {
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Everything a block may need while it runs
///
/// Cheap to clone: collaborators are behind `Arc`s.
#[derive(Clone)]
pub struct RunContext {
    pub storage: Arc<dyn Storage>,
    pub loader: ScenarioLoader,
    pub task_id: Uuid,
    pub author: String,
    /// Nesting depth of sub-pipelines, 0 for a top-level task
    pub depth: usize,
    pub limits: EngineLimits,
    pub cancel: CancellationToken,
    pub request_id: String,
}

impl RunContext {
    pub fn new(
        storage: Arc<dyn Storage>,
        loader: ScenarioLoader,
        task_id: Uuid,
        author: impl Into<String>,
        limits: EngineLimits,
    ) -> Self {
        Self {
            storage,
            loader,
            task_id,
            author: author.into(),
            depth: 0,
            limits,
            cancel: CancellationToken::new(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Context for a sub-pipeline task one level deeper
    ///
    /// The child token is cancelled together with the parent.
    pub fn nested(&self, task_id: Uuid) -> Self {
        Self {
            task_id,
            depth: self.depth + 1,
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn call_context(&self) -> CallContext {
        CallContext {
            request_id: self.request_id.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// The execution protocol of a scenario block
#[async_trait]
pub trait Block: Send + Sync {
    /// Name of the block in the scenario (`blocks` key)
    fn name(&self) -> &str;

    /// Type tag recorded in step records
    fn block_type(&self) -> &str;

    /// Local input name → qualified store key
    fn inputs(&self) -> &BTreeMap<String, String>;

    /// Local output name → qualified store key
    fn outputs(&self) -> &BTreeMap<String, String>;

    fn model(&self) -> BlockModel;

    /// Execute the block against the store. An error is fatal for the task.
    async fn run(&mut self, ctx: &RunContext, store: &VariableStore) -> Result<()>;

    /// Successor after the last `run`; `None` terminates the task
    fn next(&self, store: &VariableStore) -> Option<String>;

    /// Private persisted state (`None` for stateless blocks)
    fn state(&self) -> Option<Value> {
        None
    }

    /// Restore private state recorded in a step
    fn set_state(&mut self, _state: &Value) -> Result<()> {
        Ok(())
    }

    /// Human-in-the-loop mutation hook
    async fn update(&mut self, _ctx: &RunContext, data: &BlockUpdateData) -> Result<Option<Value>> {
        Err(PipelinerError::InvalidInput(format!(
            "block {} does not support update action {}",
            self.name(),
            data.action
        )))
    }

    fn is_scenario(&self) -> bool {
        false
    }
}
