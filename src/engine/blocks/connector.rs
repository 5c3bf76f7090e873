// Connector block - joins several inputs into one array

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use super::{default_next, edge, model, values_model, BlockHeader, SHAPE_CONNECTOR};
use crate::engine::block::{Block, BlockModel, RunContext};
use crate::engine::store::VariableStore;
use crate::models::BlockDescriptor;
use crate::Result;

pub const TITLE: &str = "connector";
const OUTPUT: &str = "Output";

/// Collects its inputs, in declared order, into the `Output` array
///
/// Each present input becomes one element; absent and null inputs are skipped.
pub struct ConnectorBlock {
    header: BlockHeader,
    /// Input aliases in the order the descriptor declares them
    ordered_inputs: Vec<String>,
    next: Option<String>,
}

impl ConnectorBlock {
    pub fn new(name: &str, descriptor: &BlockDescriptor) -> Self {
        Self {
            header: BlockHeader::from_descriptor(name, descriptor),
            ordered_inputs: descriptor.input.iter().filter_map(|v| v.global.clone()).collect(),
            next: edge(&descriptor.next),
        }
    }

    pub fn registered_model(block_type: &str) -> BlockModel {
        model(
            block_type,
            TITLE,
            Vec::new(),
            values_model(&[(OUTPUT, "array")]),
            default_next(),
            SHAPE_CONNECTOR,
        )
    }
}

#[async_trait]
impl Block for ConnectorBlock {
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
        let mut joined = Vec::new();
        for alias in &self.ordered_inputs {
            match store.get(alias) {
                None | Some(Value::Null) => {}
                Some(value) => joined.push(value),
            }
        }
        store.set_with_output(&self.header.outputs, OUTPUT, Value::Array(joined));
        Ok(())
    }

    fn next(&self, _store: &VariableStore) -> Option<String> {
        self.next.clone()
    }
}
