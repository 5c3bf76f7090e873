// Identity directory - user lookup by login and free-text search

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

use super::cache::ReadThroughCache;
use super::http::{join_url, CallContext, HttpClient};
use crate::{PipelinerError, Result};

const SYSTEM: &str = "people";
const SEARCH_PATH: &str = "search/attributes";

const USER_PREFIX: &str = "user";
const USERS_PREFIX: &str = "users";

/// A directory user; attributes the runtime does not interpret stay opaque
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsoUser {
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub attributes: Value,
}

#[derive(Debug, Deserialize)]
struct SearchUsersResponse {
    #[serde(default)]
    resources: Vec<SsoUser>,
}

#[async_trait]
pub trait PeopleService: Send + Sync {
    /// Exact lookup by login
    async fn get_user(&self, login: &str, ctx: &CallContext) -> Result<SsoUser>;

    /// Free-text search, at most `limit` users
    async fn get_users(&self, search: &str, limit: usize, ctx: &CallContext) -> Result<Vec<SsoUser>>;

    async fn get_user_email(&self, login: &str, ctx: &CallContext) -> Result<String> {
        Ok(self.get_user(login, ctx).await?.email)
    }

    async fn ping(&self, ctx: &CallContext) -> Result<()>;
}

/// Upstream directory over HTTP
pub struct HttpPeopleService {
    http: HttpClient,
    base_url: String,
    search_url: String,
}

impl HttpPeopleService {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let search_url = join_url(&base_url, SEARCH_PATH);
        Self {
            http,
            base_url,
            search_url,
        }
    }

    async fn search(&self, search: &str, limit: usize, ctx: &CallContext) -> Result<Vec<SsoUser>> {
        let search = search.trim();
        if search.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!(
            "{}?search={}&limit={}",
            self.search_url,
            urlencoding::encode(search),
            limit
        );
        let resp: SearchUsersResponse = self.http.get_json(SYSTEM, &url, ctx).await?;
        Ok(resp.resources)
    }
}

#[async_trait]
impl PeopleService for HttpPeopleService {
    #[instrument(skip(self, ctx))]
    async fn get_user(&self, login: &str, ctx: &CallContext) -> Result<SsoUser> {
        self.search(login, 1, ctx)
            .await?
            .into_iter()
            .find(|u| u.username == login)
            .ok_or_else(|| PipelinerError::NotFound(format!("user {}", login)))
    }

    #[instrument(skip(self, ctx))]
    async fn get_users(&self, search: &str, limit: usize, ctx: &CallContext) -> Result<Vec<SsoUser>> {
        self.search(search, limit, ctx).await
    }

    async fn ping(&self, ctx: &CallContext) -> Result<()> {
        self.http.ping(SYSTEM, &self.base_url, ctx).await
    }
}

/// Read-through cache in front of another directory implementation
pub struct CachedPeopleService {
    inner: Arc<dyn PeopleService>,
    cache: ReadThroughCache,
}

impl CachedPeopleService {
    pub fn new(inner: Arc<dyn PeopleService>, cache: ReadThroughCache) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl PeopleService for CachedPeopleService {
    async fn get_user(&self, login: &str, ctx: &CallContext) -> Result<SsoUser> {
        self.cache
            .get_or_fetch(USER_PREFIX, &login, || self.inner.get_user(login, ctx))
            .await
    }

    async fn get_users(&self, search: &str, limit: usize, ctx: &CallContext) -> Result<Vec<SsoUser>> {
        self.cache
            .get_or_fetch(USERS_PREFIX, &(search, limit), || self.inner.get_users(search, limit, ctx))
            .await
    }

    async fn ping(&self, ctx: &CallContext) -> Result<()> {
        self.inner.ping(ctx).await
    }
}
