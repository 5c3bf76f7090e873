// Strings-equal block - routes on equality of its string inputs

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{edge, model, values_model, BlockHeader, SHAPE_CONDITION};
use crate::engine::block::{Block, BlockModel, RunContext};
use crate::engine::store::VariableStore;
use crate::models::BlockDescriptor;
use crate::Result;

pub const TITLE: &str = "strings_is_equal";
const MIN_OPERANDS: usize = 2;

pub struct StringsEqualBlock {
    header: BlockHeader,
    on_true: Option<String>,
    on_false: Option<String>,
}

impl StringsEqualBlock {
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
            values_model(&[("first", "string"), ("second", "string")]),
            Vec::new(),
            &["on_true", "on_false"],
            SHAPE_CONDITION,
        )
    }

    /// All declared operands, read as strings
    fn operands(&self, store: &VariableStore) -> Result<Vec<String>> {
        self.header
            .inputs
            .keys()
            .map(|key| store.get_string_with_input(&self.header.inputs, key))
            .collect()
    }

    fn all_equal(operands: &[String]) -> bool {
        operands.len() >= MIN_OPERANDS && operands.iter().all(|o| *o == operands[0])
    }
}

#[async_trait]
impl Block for StringsEqualBlock {
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
        self.operands(store)?;
        Ok(())
    }

    fn next(&self, store: &VariableStore) -> Option<String> {
        match self.operands(store) {
            Ok(operands) if Self::all_equal(&operands) => self.on_true.clone(),
            _ => self.on_false.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::create_test_context;
    use crate::models::FunctionValue;
    use serde_json::json;

    fn create_test_block(operands: &[&str]) -> StringsEqualBlock {
        let mut descriptor = BlockDescriptor::new("internal", TITLE);
        descriptor.input = operands
            .iter()
            .map(|o| FunctionValue::new(*o, "string").with_global(format!("S.{}", o)))
            .collect();
        descriptor.on_true = Some("BlockTrue".to_string());
        descriptor.on_false = Some("BlockFalse".to_string());
        StringsEqualBlock::new("Equal", &descriptor)
    }

    #[tokio::test]
    async fn test_equal_operands_route_true() {
        let ctx = create_test_context();
        let mut block = create_test_block(&["first", "second"]);
        let store = VariableStore::new();
        store.set("S.first", json!("Value"));
        store.set("S.second", json!("Value"));

        block.run(&ctx, &store).await.unwrap();
        assert_eq!(block.next(&store).as_deref(), Some("BlockTrue"));

        store.set("S.second", json!("Unexpected"));
        assert_eq!(block.next(&store).as_deref(), Some("BlockFalse"));
    }

    #[tokio::test]
    async fn test_single_operand_is_never_equal() {
        let ctx = create_test_context();
        let mut block = create_test_block(&["first"]);
        let store = VariableStore::new();
        store.set("S.first", json!("Value"));

        block.run(&ctx, &store).await.unwrap();
        assert_eq!(block.next(&store).as_deref(), Some("BlockFalse"));
    }
}
