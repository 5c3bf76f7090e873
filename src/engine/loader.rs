// Scenario loader - scenario documents into executable pipelines

//! # Scenario Loader
//!
//! Validates a scenario document and constructs one block per descriptor.
//! Integration leaves get the shared [`HttpClient`] and their base URL from
//! [`Endpoints`] here; pure blocks get nothing but their descriptor.
//!
//! ## Dispatch
//!
//! | `block_type`                | kind chosen by                       |
//! |-----------------------------|--------------------------------------|
//! | `python3`                   | always a function call (`title` = function) |
//! | `internal`, `term`, `go`    | `title`                              |
//! | `scenario`                  | always a sub-pipeline (`title` = scenario name) |

use std::collections::BTreeMap;
use std::sync::Arc;

use super::block::{Block, BlockModel};
use super::blocks::{
    connector, equal, for_state, if_state, input, ngsa, vars, ConnectorBlock, ForStateBlock, FunctionBlock,
    IfStateBlock, InputBlock, NgsaSendBlock, RemedyBlock, RemedyKind, ScenarioBlock, StringsEqualBlock, VarsBlock,
    TYPE_GO, TYPE_INTERNAL, TYPE_PYTHON3, TYPE_SCENARIO, TYPE_TERM,
};
use super::pipeline::ExecutablePipeline;
use crate::integrations::http::HttpClient;
use crate::integrations::metrics::MetricsSink;
use crate::integrations::Endpoints;
use crate::models::{BlockDescriptor, Scenario};
use crate::{PipelinerError, Result};

/// Builds pipelines; cheap to clone and shared by every run
#[derive(Clone)]
pub struct ScenarioLoader {
    http: HttpClient,
    endpoints: Arc<Endpoints>,
}

impl ScenarioLoader {
    pub fn new(http: HttpClient, endpoints: Endpoints) -> Self {
        Self {
            http,
            endpoints: Arc::new(endpoints),
        }
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn metrics(&self) -> Arc<dyn MetricsSink> {
        self.http.metrics()
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Validate and construct
    pub fn build(&self, scenario: &Scenario) -> Result<ExecutablePipeline> {
        validate(scenario)?;

        let mut blocks: BTreeMap<String, Box<dyn Block>> = BTreeMap::new();
        for (name, descriptor) in &scenario.pipeline.blocks {
            blocks.insert(name.clone(), self.create_block(name, descriptor)?);
        }
        Ok(ExecutablePipeline::new(scenario, blocks))
    }

    pub fn create_block(&self, name: &str, descriptor: &BlockDescriptor) -> Result<Box<dyn Block>> {
        match descriptor.block_type.as_str() {
            TYPE_PYTHON3 => Ok(Box::new(FunctionBlock::new(
                name,
                descriptor,
                self.http.clone(),
                &self.endpoints.function_store,
            ))),
            TYPE_SCENARIO => Ok(Box::new(ScenarioBlock::new(name, descriptor))),
            TYPE_INTERNAL | TYPE_TERM | TYPE_GO => self.create_internal(name, descriptor),
            other => Err(PipelinerError::UnknownBlockType(other.to_string())),
        }
    }

    fn create_internal(&self, name: &str, descriptor: &BlockDescriptor) -> Result<Box<dyn Block>> {
        let block: Box<dyn Block> = match descriptor.title.as_str() {
            input::TITLE => Box::new(InputBlock::new(name, descriptor)),
            if_state::TITLE => Box::new(IfStateBlock::new(name, descriptor)),
            equal::TITLE => Box::new(StringsEqualBlock::new(name, descriptor)),
            for_state::TITLE => Box::new(ForStateBlock::new(name, descriptor)),
            connector::TITLE => Box::new(ConnectorBlock::new(name, descriptor)),
            vars::TITLE => Box::new(VarsBlock::new(name, descriptor)),
            ngsa::TITLE => Box::new(NgsaSendBlock::new(
                name,
                descriptor,
                self.http.clone(),
                &self.endpoints.ngsa,
            )),
            title => match RemedyKind::from_title(title) {
                Some(kind) => Box::new(RemedyBlock::new(
                    name,
                    descriptor,
                    kind,
                    self.http.clone(),
                    &self.endpoints.remedy,
                    self.endpoints.remedy_fail_on_bad_status,
                )),
                None => {
                    return Err(PipelinerError::UnknownBlockType(format!(
                        "{}/{}",
                        descriptor.block_type, title
                    )))
                }
            },
        };
        Ok(block)
    }
}

/// Models of every block kind the loader can build
pub fn registered_models() -> Vec<BlockModel> {
    let mut models = vec![
        FunctionBlock::registered_model(),
        ScenarioBlock::registered_model(),
        InputBlock::registered_model(TYPE_INTERNAL),
        IfStateBlock::registered_model(TYPE_INTERNAL),
        StringsEqualBlock::registered_model(TYPE_INTERNAL),
        ForStateBlock::registered_model(TYPE_INTERNAL),
        ConnectorBlock::registered_model(TYPE_INTERNAL),
        VarsBlock::registered_model(TYPE_INTERNAL),
        NgsaSendBlock::registered_model(TYPE_INTERNAL),
    ];
    models.extend(
        RemedyKind::ALL
            .into_iter()
            .map(|kind| RemedyBlock::registered_model(TYPE_INTERNAL, kind)),
    );
    models
}

/// Structural checks that do not need any collaborator
pub fn validate(scenario: &Scenario) -> Result<()> {
    let blocks = &scenario.pipeline.blocks;
    let entrypoint = &scenario.pipeline.entrypoint;
    if !blocks.contains_key(entrypoint) {
        return Err(PipelinerError::MissingEntrypoint(entrypoint.clone()));
    }

    for (name, descriptor) in blocks {
        for (_, successor) in descriptor.successors() {
            if !blocks.contains_key(successor) {
                return Err(PipelinerError::UnknownSuccessor {
                    block: name.clone(),
                    successor: successor.to_string(),
                });
            }
        }
    }
    Ok(())
}
