// Service-desk catalog - work groups and form schemas

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, instrument};

use super::cache::ReadThroughCache;
use super::http::{join_url, CallContext, HttpClient};
use crate::Result;

const SYSTEM: &str = "servicedesc";

const WORKGROUP_PREFIX: &str = "workgroup";
const SCHEMA_PREFIX: &str = "schema";
const BLUEPRINT_SCHEMA_PREFIX: &str = "blueprintSchema";

const WORKGROUP_PATH: &str = "api/chainsmith/v1/workGroup";
const SCHEMA_PATH: &str = "api/herald/v1/schema";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkGroup {
    #[serde(rename = "groupID")]
    pub group_id: String,
    pub group_name: String,
    #[serde(default)]
    pub people: Vec<GroupMember>,
}

/// JSON-schema document of a form, kept opaque
pub type Schema = Map<String, Value>;

#[async_trait]
pub trait WorkGroupService: Send + Sync {
    async fn get_work_group(&self, group_id: &str, ctx: &CallContext) -> Result<WorkGroup>;

    async fn get_schema_by_id(&self, schema_id: &str, ctx: &CallContext) -> Result<Schema>;

    async fn get_schema_by_blueprint_id(&self, blueprint_id: &str, ctx: &CallContext) -> Result<Schema>;

    async fn ping(&self, ctx: &CallContext) -> Result<()>;
}

pub struct HttpWorkGroupService {
    http: HttpClient,
    base_url: String,
}

impl HttpWorkGroupService {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl WorkGroupService for HttpWorkGroupService {
    #[instrument(skip(self, ctx))]
    async fn get_work_group(&self, group_id: &str, ctx: &CallContext) -> Result<WorkGroup> {
        let url = join_url(&self.base_url, &format!("{}/{}", WORKGROUP_PATH, group_id));
        let group: WorkGroup = self.http.get_json(SYSTEM, &url, ctx).await?;
        info!(members = group.people.len(), group = %group.group_name, "got work group");
        Ok(group)
    }

    #[instrument(skip(self, ctx))]
    async fn get_schema_by_id(&self, schema_id: &str, ctx: &CallContext) -> Result<Schema> {
        let url = join_url(&self.base_url, &format!("{}/{}", SCHEMA_PATH, schema_id));
        self.http.get_json(SYSTEM, &url, ctx).await
    }

    #[instrument(skip(self, ctx))]
    async fn get_schema_by_blueprint_id(&self, blueprint_id: &str, ctx: &CallContext) -> Result<Schema> {
        let url = join_url(&self.base_url, &format!("{}/{}/json", SCHEMA_PATH, blueprint_id));
        self.http.get_json(SYSTEM, &url, ctx).await
    }

    async fn ping(&self, ctx: &CallContext) -> Result<()> {
        self.http.ping(SYSTEM, &self.base_url, ctx).await
    }
}

pub struct CachedWorkGroupService {
    inner: Arc<dyn WorkGroupService>,
    cache: ReadThroughCache,
}

impl CachedWorkGroupService {
    pub fn new(inner: Arc<dyn WorkGroupService>, cache: ReadThroughCache) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl WorkGroupService for CachedWorkGroupService {
    async fn get_work_group(&self, group_id: &str, ctx: &CallContext) -> Result<WorkGroup> {
        self.cache
            .get_or_fetch(WORKGROUP_PREFIX, &group_id, || self.inner.get_work_group(group_id, ctx))
            .await
    }

    async fn get_schema_by_id(&self, schema_id: &str, ctx: &CallContext) -> Result<Schema> {
        self.cache
            .get_or_fetch(SCHEMA_PREFIX, &schema_id, || self.inner.get_schema_by_id(schema_id, ctx))
            .await
    }

    async fn get_schema_by_blueprint_id(&self, blueprint_id: &str, ctx: &CallContext) -> Result<Schema> {
        self.cache
            .get_or_fetch(BLUEPRINT_SCHEMA_PREFIX, &blueprint_id, || {
                self.inner.get_schema_by_blueprint_id(blueprint_id, ctx)
            })
            .await
    }

    async fn ping(&self, ctx: &CallContext) -> Result<()> {
        self.inner.ping(ctx).await
    }
}
