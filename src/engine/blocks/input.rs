// Input block - entry of a scenario, parameters are already seeded

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{default_next, edge, model, BlockHeader, SHAPE_FUNCTION};
use crate::engine::block::{Block, BlockModel, RunContext};
use crate::engine::store::VariableStore;
use crate::models::BlockDescriptor;
use crate::Result;

pub const TITLE: &str = "input";

pub struct InputBlock {
    header: BlockHeader,
    next: Option<String>,
}

impl InputBlock {
    pub fn new(name: &str, descriptor: &BlockDescriptor) -> Self {
        Self {
            header: BlockHeader::from_descriptor(name, descriptor),
            next: edge(&descriptor.next),
        }
    }

    pub fn registered_model(block_type: &str) -> BlockModel {
        model(block_type, TITLE, Vec::new(), Vec::new(), default_next(), SHAPE_FUNCTION)
    }
}

#[async_trait]
impl Block for InputBlock {
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

    async fn run(&mut self, _ctx: &RunContext, _store: &VariableStore) -> Result<()> {
        Ok(())
    }

    fn next(&self, _store: &VariableStore) -> Option<String> {
        self.next.clone()
    }
}
