// Function block - calls a function of the function store

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use super::{default_next, edge, model, BlockHeader, SHAPE_FUNCTION, TYPE_PYTHON3};
use crate::engine::block::{Block, BlockModel, RunContext};
use crate::engine::store::VariableStore;
use crate::integrations::http::{expect_ok, join_url, HttpClient};
use crate::models::BlockDescriptor;
use crate::Result;

pub const SYSTEM: &str = "function_store";

/// Posts its resolved inputs to `<function_store>/function/<title>`
///
/// Inputs missing from the store are left out of the body. Every declared
/// output is written from the same-named field of the response (`null` when
/// the function did not return it).
pub struct FunctionBlock {
    header: BlockHeader,
    next: Option<String>,
    http: HttpClient,
    run_url: String,
}

impl FunctionBlock {
    pub fn new(name: &str, descriptor: &BlockDescriptor, http: HttpClient, function_store: &str) -> Self {
        Self {
            header: BlockHeader::from_descriptor(name, descriptor),
            next: edge(&descriptor.next),
            http,
            run_url: join_url(function_store, &format!("function/{}", descriptor.title)),
        }
    }

    pub fn registered_model() -> BlockModel {
        model(TYPE_PYTHON3, "function", Vec::new(), Vec::new(), default_next(), SHAPE_FUNCTION)
    }

    fn request_body(&self, store: &VariableStore) -> Value {
        let mut body = Map::new();
        for (local, alias) in &self.header.inputs {
            if let Some(value) = store.get(alias) {
                body.insert(local.clone(), value);
            }
        }
        Value::Object(body)
    }

    async fn call(&self, ctx: &RunContext, store: &VariableStore) -> Result<()> {
        let body = self.request_body(store);
        debug!(url = %self.run_url, %body, "calling function");

        let resp = self
            .http
            .send(SYSTEM, Method::POST, &self.run_url, Some(&body), &ctx.call_context())
            .await?;
        expect_ok(SYSTEM, &resp)?;

        let result: Option<Map<String, Value>> = resp.json()?;
        let result = result.unwrap_or_default();
        for (local, alias) in &self.header.outputs {
            store.set(alias, result.get(local).cloned().unwrap_or(Value::Null));
        }
        Ok(())
    }
}

#[async_trait]
impl Block for FunctionBlock {
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

    #[instrument(skip_all, fields(block = %self.header.name, function = %self.header.title))]
    async fn run(&mut self, ctx: &RunContext, store: &VariableStore) -> Result<()> {
        let outcome = self.call(ctx, store).await;
        self.http.metrics().integration_result(SYSTEM, outcome.is_ok());
        outcome
    }

    fn next(&self, _store: &VariableStore) -> Option<String> {
        self.next.clone()
    }
}
