// Work-number sequence - human-readable task numbers

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::http::{join_url, CallContext, HttpClient};
use crate::Result;

const SYSTEM: &str = "sequence";
const WORK_NUMBER_PATH: &str = "v1/work-number";

#[async_trait]
pub trait SequenceClient: Send + Sync {
    async fn next_work_number(&self, ctx: &CallContext) -> Result<String>;

    async fn ping(&self, ctx: &CallContext) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkNumberResponse {
    work_number: String,
}

pub struct HttpSequenceClient {
    http: HttpClient,
    base_url: String,
}

impl HttpSequenceClient {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SequenceClient for HttpSequenceClient {
    async fn next_work_number(&self, ctx: &CallContext) -> Result<String> {
        let url = join_url(&self.base_url, WORK_NUMBER_PATH);
        let resp: WorkNumberResponse = self.http.get_json(SYSTEM, &url, ctx).await?;
        Ok(resp.work_number)
    }

    async fn ping(&self, ctx: &CallContext) -> Result<()> {
        self.http.ping(SYSTEM, &self.base_url, ctx).await
    }
}

/// Process-local counter, used when no sequence service is configured
#[derive(Debug, Default)]
pub struct LocalSequence {
    next: AtomicU64,
}

impl LocalSequence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceClient for LocalSequence {
    async fn next_work_number(&self, _ctx: &CallContext) -> Result<String> {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("J{:08}", n))
    }

    async fn ping(&self, _ctx: &CallContext) -> Result<()> {
        Ok(())
    }
}
