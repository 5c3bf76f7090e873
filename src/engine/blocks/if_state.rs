// If block - routes on a boolean from the store

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{edge, model, values_model, BlockHeader, SHAPE_CONDITION};
use crate::engine::block::{Block, BlockModel, RunContext};
use crate::engine::store::VariableStore;
use crate::models::BlockDescriptor;
use crate::Result;

pub const TITLE: &str = "if";
const CHECK: &str = "check";

/// Routes to `on_true` or `on_false` by the `check` input
///
/// The decision is a pure function of the store, so a restored store
/// routes the same way without any private state.
pub struct IfStateBlock {
    header: BlockHeader,
    on_true: Option<String>,
    on_false: Option<String>,
}

impl IfStateBlock {
    pub fn new(name: &str, descriptor: &BlockDescriptor) -> Self {
        Self {
            header: BlockHeader::from_descriptor(name, descriptor),
            on_true: edge(&descriptor.on_true),
            on_false: edge(&descriptor.on_false),
        }
    }

    pub fn registered_model(block_type: &str) -> BlockModel {
        model(
            block_type,
            TITLE,
            values_model(&[(CHECK, "boolean")]),
            Vec::new(),
            &["on_true", "on_false"],
            SHAPE_CONDITION,
        )
    }
}

#[async_trait]
impl Block for IfStateBlock {
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
        store.get_bool_with_input(&self.header.inputs, CHECK)?;
        Ok(())
    }

    fn next(&self, store: &VariableStore) -> Option<String> {
        match store.get_bool_with_input(&self.header.inputs, CHECK) {
            Ok(true) => self.on_true.clone(),
            _ => self.on_false.clone(),
        }
    }
}
