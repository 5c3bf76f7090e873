// Shared fixtures for engine unit tests

use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use super::block::RunContext;
use super::loader::ScenarioLoader;
use super::pipeline::EngineLimits;
use super::storage::InMemoryStorage;
use crate::integrations::http::{HttpClient, RetryPolicy};
use crate::integrations::metrics::InMemoryMetrics;
use crate::integrations::Endpoints;
use crate::models::Scenario;

pub(crate) fn create_test_loader() -> ScenarioLoader {
    let http = HttpClient::new(RetryPolicy::default(), Arc::new(InMemoryMetrics::new())).unwrap();
    ScenarioLoader::new(http, Endpoints::default())
}

pub(crate) fn create_test_context() -> RunContext {
    RunContext::new(
        Arc::new(InMemoryStorage::new()),
        create_test_loader(),
        Uuid::new_v4(),
        "tester",
        EngineLimits::default(),
    )
}

pub(crate) fn scenario_from(doc: Value) -> Scenario {
    serde_json::from_value(doc).unwrap()
}
