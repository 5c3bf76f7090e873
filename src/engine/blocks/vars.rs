// Vars block - copies values between namespaces

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{default_next, edge, model, BlockHeader, SHAPE_FUNCTION};
use crate::engine::block::{Block, BlockModel, RunContext};
use crate::engine::store::VariableStore;
use crate::models::BlockDescriptor;
use crate::Result;

pub const TITLE: &str = "vars";

/// For every output with an input of the same local name, copy input → output
pub struct VarsBlock {
    header: BlockHeader,
    next: Option<String>,
}

impl VarsBlock {
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
impl Block for VarsBlock {
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
        for (local, target) in &self.header.outputs {
            let Some(source) = self.header.inputs.get(local) else {
                continue;
            };
            if let Some(value) = store.get(source) {
                store.set(target, value);
            }
        }
        Ok(())
    }

    fn next(&self, _store: &VariableStore) -> Option<String> {
        self.next.clone()
    }
}
