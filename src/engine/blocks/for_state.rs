// For block - iterates a sequence, one element per invocation

//! The engine calls the same `for` block once per element: each call copies
//! the current element to `now_on` and routes to `body`; the call after the
//! last element routes to `after` and resets the counter so an enclosing
//! loop can run it again. The counter is private state persisted with every
//! step, so a restored task continues where it stopped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::{edge, model, values_model, BlockHeader, SHAPE_CYCLE};
use crate::engine::block::{Block, BlockModel, BlockUpdateData, RunContext};
use crate::engine::store::VariableStore;
use crate::models::BlockDescriptor;
use crate::{PipelinerError, Result};

pub const TITLE: &str = "for";
const ITER: &str = "iter";
const NOW_ON: &str = "now_on";
const INDEX: &str = "index";
const RESET_ACTION: &str = "reset";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForState {
    /// Elements handed out so far
    pub index: usize,
    /// Whether the last invocation routed into the body
    pub looping: bool,
}

pub struct ForStateBlock {
    header: BlockHeader,
    body: Option<String>,
    after: Option<String>,
    state: ForState,
}

impl ForStateBlock {
    pub fn new(name: &str, descriptor: &BlockDescriptor) -> Self {
        Self {
            header: BlockHeader::from_descriptor(name, descriptor),
            body: edge(&descriptor.body),
            after: edge(&descriptor.after),
            state: ForState::default(),
        }
    }

    pub fn registered_model(block_type: &str) -> BlockModel {
        model(
            block_type,
            TITLE,
            values_model(&[(ITER, "array")]),
            values_model(&[(NOW_ON, "any"), (INDEX, "number")]),
            &["body", "after"],
            SHAPE_CYCLE,
        )
    }

    pub fn current(&self) -> ForState {
        self.state
    }
}

#[async_trait]
impl Block for ForStateBlock {
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
        Self::registered_model(&self.header.block_type)
    }

    async fn run(&mut self, _ctx: &RunContext, store: &VariableStore) -> Result<()> {
        let alias = self
            .header
            .inputs
            .get(ITER)
            .ok_or_else(|| PipelinerError::InvalidInput(format!("{} has no {} input", self.header.name, ITER)))?;
        let items = store.get_array(alias)?;

        match items.get(self.state.index) {
            Some(item) => {
                store.set_with_output(&self.header.outputs, NOW_ON, item.clone());
                self.state.index += 1;
                self.state.looping = true;
                store.set_with_output(&self.header.outputs, INDEX, json!(self.state.index));
            }
            None => {
                debug!(block = %self.header.name, len = items.len(), "loop finished");
                self.state = ForState::default();
            }
        }
        Ok(())
    }

    fn next(&self, _store: &VariableStore) -> Option<String> {
        if self.state.looping {
            self.body.clone()
        } else {
            self.after.clone()
        }
    }

    fn state(&self) -> Option<Value> {
        serde_json::to_value(self.state).ok()
    }

    fn set_state(&mut self, state: &Value) -> Result<()> {
        self.state = serde_json::from_value(state.clone())?;
        Ok(())
    }

    async fn update(&mut self, _ctx: &RunContext, data: &BlockUpdateData) -> Result<Option<Value>> {
        if data.action != RESET_ACTION {
            return Err(PipelinerError::InvalidInput(format!(
                "block {} does not support update action {}",
                self.header.name, data.action
            )));
        }
        self.state = ForState::default();
        Ok(self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::create_test_context;
    use crate::models::FunctionValue;

    fn create_test_block() -> ForStateBlock {
        let mut descriptor = BlockDescriptor::new("internal", TITLE);
        descriptor.input = vec![FunctionValue::new(ITER, "array").with_global("Gen.items")];
        descriptor.output = vec![
            FunctionValue::new(NOW_ON, "string").with_global("For.now_on"),
            FunctionValue::new(INDEX, "number").with_global("For.index"),
        ];
        descriptor.body = Some("Body".to_string());
        descriptor.after = Some("After".to_string());
        ForStateBlock::new("For", &descriptor)
    }

    #[tokio::test]
    async fn test_body_runs_once_per_element_then_after() {
        let ctx = create_test_context();
        let mut block = create_test_block();
        let store = VariableStore::new();
        store.set("Gen.items", json!(["a", "b", "c"]));

        let mut routes = Vec::new();
        for _ in 0..4 {
            block.run(&ctx, &store).await.unwrap();
            routes.push(block.next(&store).unwrap());
        }

        assert_eq!(routes, vec!["Body", "Body", "Body", "After"]);
        assert_eq!(store.get("For.now_on"), Some(json!("c")));
        assert_eq!(store.get("For.index"), Some(json!(3)));
        assert_eq!(block.current(), ForState::default());
    }

    #[tokio::test]
    async fn test_empty_sequence_goes_straight_after() {
        let ctx = create_test_context();
        let mut block = create_test_block();
        let store = VariableStore::new();
        store.set("Gen.items", json!([]));

        block.run(&ctx, &store).await.unwrap();
        assert_eq!(block.next(&store).as_deref(), Some("After"));
        assert!(store.get("For.now_on").is_none());
    }

    #[tokio::test]
    async fn test_state_restores_counter() {
        let ctx = create_test_context();
        let store = VariableStore::new();
        store.set("Gen.items", json!([1, 2, 3]));

        let mut first = create_test_block();
        first.run(&ctx, &store).await.unwrap();
        first.run(&ctx, &store).await.unwrap();
        let saved = first.state().unwrap();

        let mut restored = create_test_block();
        restored.set_state(&saved).unwrap();
        restored.run(&ctx, &store).await.unwrap();
        assert_eq!(store.get("For.now_on"), Some(json!(3)));
        assert_eq!(restored.next(&store).as_deref(), Some("Body"));
    }

    #[tokio::test]
    async fn test_reset_action() {
        let ctx = create_test_context();
        let mut block = create_test_block();
        let store = VariableStore::new();
        store.set("Gen.items", json!([1, 2]));
        block.run(&ctx, &store).await.unwrap();

        let reset = BlockUpdateData {
            action: RESET_ACTION.to_string(),
            parameters: Value::Null,
        };
        block.update(&ctx, &reset).await.unwrap();
        assert_eq!(block.current().index, 0);

        let unknown = BlockUpdateData {
            action: "skip".to_string(),
            parameters: Value::Null,
        };
        assert!(matches!(
            block.update(&ctx, &unknown).await,
            Err(PipelinerError::InvalidInput(_))
        ));
    }
}
