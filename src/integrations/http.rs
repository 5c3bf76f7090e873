// Outbound HTTP client - retries, per-attempt timeout, cancellation and metrics

//! # Integration HTTP Client
//!
//! Every outbound call of the runtime (function store, Remedy, NGSA, catalog
//! services) goes through [`HttpClient::send`]. Retry and metric collection
//! live here and nowhere else:
//!
//! - bounded attempts (`max_retries + 1`) with a fixed delay between them
//! - transport errors, `5xx` and `429` are retried; other statuses are returned
//! - every attempt carries a timeout and the `X-Request-Id` of the run
//! - cancellation aborts the in-flight attempt and stops retrying
//! - every attempt emits an [`ExternalRequestInfo`]
//!
//! Callers decide whether a returned non-200 status is fatal.

use bytes::Bytes;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::metrics::{ExternalRequestInfo, MetricsSink};
use crate::{PipelinerError, Result};

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Retry budget of the client
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Per-attempt timeout
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Request-scoped data propagated into outbound calls
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: String,
    pub cancel: CancellationToken,
}

impl CallContext {
    /// Context for calls not tied to a request (health checks, background jobs)
    pub fn background() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Status and raw body of a completed call
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Parse the body as JSON; an empty body reads as `null`
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.body.is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

fn is_retryable(status: u16) -> bool {
    status >= 500 || status == 429
}

/// Shared outbound client
///
/// Cloning is cheap; the underlying `reqwest::Client` pools connections.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    policy: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl HttpClient {
    pub fn new(policy: RetryPolicy, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self::with_client(client, policy, metrics))
    }

    pub fn with_client(client: reqwest::Client, policy: RetryPolicy, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { client, policy, metrics }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> Arc<dyn MetricsSink> {
        self.metrics.clone()
    }

    /// Send with retries; returns the last response or an `Integration` error
    #[tracing::instrument(skip(self, body, ctx), fields(request_id = %ctx.request_id))]
    pub async fn send(
        &self,
        system: &str,
        method: Method,
        url: &str,
        body: Option<&Value>,
        ctx: &CallContext,
    ) -> Result<HttpResponse> {
        let attempts = self.policy.max_retries + 1;
        let mut last_failure = String::new();
        let mut last_response: Option<HttpResponse> = None;

        for attempt in 1..=attempts {
            if ctx.cancel.is_cancelled() {
                return Err(PipelinerError::Cancelled);
            }

            let mut request = self
                .client
                .request(method.clone(), url)
                .timeout(self.policy.timeout)
                .header(REQUEST_ID_HEADER, ctx.request_id.as_str());
            if let Some(body) = body {
                request = request.json(body);
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(PipelinerError::Cancelled),
                res = async {
                    let resp = request.send().await?;
                    let status = resp.status().as_u16();
                    let body = resp.bytes().await?;
                    Ok::<_, reqwest::Error>(HttpResponse { status, body })
                } => res,
            };

            self.metrics.request(ExternalRequestInfo {
                external_system: system.to_string(),
                method: method.to_string(),
                url: url.to_string(),
                trace_id: ctx.request_id.clone(),
                response_code: outcome.as_ref().ok().map(|r| r.status),
                duration: started.elapsed(),
            });

            match outcome {
                Ok(resp) if !is_retryable(resp.status) => {
                    debug!(system, url, status = resp.status, attempt, "external call done");
                    return Ok(resp);
                }
                Ok(resp) => {
                    warn!(system, url, status = resp.status, attempt, "external call failed, retrying");
                    last_failure = format!("status {}", resp.status);
                    last_response = Some(resp);
                }
                Err(e) => {
                    warn!(system, url, attempt, error = %e, "external call failed, retrying");
                    last_failure = e.to_string();
                    last_response = None;
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(PipelinerError::Cancelled),
                    _ = tokio::time::sleep(self.policy.retry_delay) => {}
                }
            }
        }

        // A retryable status that never recovered is still a response
        match last_response {
            Some(resp) => Ok(resp),
            None => Err(PipelinerError::Integration {
                system: system.to_string(),
                message: format!("{} attempts exhausted: {}", attempts, last_failure),
            }),
        }
    }

    /// GET and decode a 200 JSON response
    pub async fn get_json<T: DeserializeOwned>(&self, system: &str, url: &str, ctx: &CallContext) -> Result<T> {
        let resp = self.send(system, Method::GET, url, None, ctx).await?;
        expect_ok(system, &resp)?;
        resp.json()
    }

    /// POST a JSON body and decode a 200 JSON response
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        system: &str,
        url: &str,
        body: &Value,
        ctx: &CallContext,
    ) -> Result<T> {
        let resp = self.send(system, Method::POST, url, Some(body), ctx).await?;
        expect_ok(system, &resp)?;
        resp.json()
    }

    /// Health probe: any answer below 500 counts as alive
    pub async fn ping(&self, system: &str, url: &str, ctx: &CallContext) -> Result<()> {
        let resp = self.send(system, Method::GET, url, None, ctx).await?;
        if resp.status >= 500 {
            return Err(PipelinerError::Integration {
                system: system.to_string(),
                message: format!("ping answered {}", resp.status),
            });
        }
        Ok(())
    }
}

pub(crate) fn expect_ok(system: &str, resp: &HttpResponse) -> Result<()> {
    if resp.is_ok() {
        return Ok(());
    }
    Err(PipelinerError::Integration {
        system: system.to_string(),
        message: format!(
            "invalid response code {}: {}",
            resp.status,
            String::from_utf8_lossy(&resp.body)
        ),
    })
}

/// Join a base URL and a path without doubling or dropping slashes
///
/// A base without scheme gets `http://`.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = if base.contains("://") {
        base.to_string()
    } else {
        format!("http://{}", base)
    };
    format!("{}/{}", base, path.trim_start_matches('/'))
}
