// External collaborators of the runtime

//! # Integrations Module
//!
//! Everything that leaves the process goes through here:
//!
//! - `http`: the retrying client every other integration uses
//! - `metrics`: the sink receiving per-call and per-block metrics
//! - `cache`: the generic read-through cache
//! - `people`, `calendar`, `delegation`, `workgroup`: cached catalog services
//! - `sequence`: work-number source used at task creation
//!
//! Block-level integrations (function store, Remedy, NGSA) are blocks in
//! `engine::blocks`; they receive the [`HttpClient`] and [`Endpoints`] from
//! the loader.

pub mod cache;
pub mod calendar;
pub mod delegation;
pub mod http;
pub mod metrics;
pub mod people;
pub mod sequence;
pub mod workgroup;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::ReadThroughCache;
pub use http::{CallContext, HttpClient, HttpResponse, RetryPolicy};
pub use metrics::{ExternalRequestInfo, InMemoryMetrics, MetricsSink, TracingMetrics};

use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::AppConfig;
use calendar::{CachedCalendarService, CalendarService, HttpCalendarService};
use delegation::{CachedDelegationService, DelegationService, HttpDelegationService};
use people::{CachedPeopleService, HttpPeopleService, PeopleService};
use sequence::{HttpSequenceClient, SequenceClient};
use workgroup::{CachedWorkGroupService, HttpWorkGroupService, WorkGroupService};

/// Base URLs handed to integration blocks; immutable after startup
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    pub function_store: String,
    pub remedy: String,
    /// Treat a non-200 Remedy answer as fatal for the block
    pub remedy_fail_on_bad_status: bool,
    pub ngsa: String,
}

/// Catalog services the runtime knows about; unset ones are skipped
#[derive(Clone, Default)]
pub struct Services {
    pub people: Option<Arc<dyn PeopleService>>,
    pub calendar: Option<Arc<dyn CalendarService>>,
    pub delegation: Option<Arc<dyn DelegationService>>,
    pub workgroup: Option<Arc<dyn WorkGroupService>>,
    pub sequence: Option<Arc<dyn SequenceClient>>,
}

/// Result of one health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    fn from_result(result: crate::Result<()>) -> Self {
        match result {
            Ok(()) => Self { ok: true, error: None },
            Err(e) => Self {
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }
}

impl Services {
    /// Build every service that has a base URL, sharing one cache
    pub fn from_config(config: &AppConfig, http: &HttpClient) -> Self {
        let cache = ReadThroughCache::with_capacity(config.cache_ttl(), config.cache.max_entries);
        let mut services = Services::default();

        if let Some(url) = config.people.url() {
            let inner = Arc::new(HttpPeopleService::new(http.clone(), url));
            services.people = Some(Arc::new(CachedPeopleService::new(inner, cache.clone())));
        }
        if !config.calendar.base_url.is_empty() {
            let inner = Arc::new(HttpCalendarService::new(
                http.clone(),
                config.calendar.base_url.clone(),
                config.calendar.default_unit_id.clone(),
            ));
            services.calendar = Some(Arc::new(CachedCalendarService::new(inner, cache.clone())));
        }
        if let Some(url) = config.delegation.url() {
            let inner = Arc::new(HttpDelegationService::new(http.clone(), url));
            services.delegation = Some(Arc::new(CachedDelegationService::new(inner, cache.clone())));
        }
        if let Some(url) = config.workgroup.url() {
            let inner = Arc::new(HttpWorkGroupService::new(http.clone(), url));
            services.workgroup = Some(Arc::new(CachedWorkGroupService::new(inner, cache)));
        }
        if let Some(url) = config.sequence.url() {
            services.sequence = Some(Arc::new(HttpSequenceClient::new(http.clone(), url)));
        }

        services
    }

    /// Ping every configured service concurrently; the report is keyed by name
    pub async fn ping_all(&self, ctx: &CallContext) -> BTreeMap<&'static str, ProbeResult> {
        let mut probes: Vec<(&'static str, BoxFuture<'_, crate::Result<()>>)> = Vec::new();

        if let Some(s) = &self.people {
            probes.push(("people", s.ping(ctx)));
        }
        if let Some(s) = &self.calendar {
            probes.push(("calendar", s.ping(ctx)));
        }
        if let Some(s) = &self.delegation {
            probes.push(("delegation", s.ping(ctx)));
        }
        if let Some(s) = &self.workgroup {
            probes.push(("workgroup", s.ping(ctx)));
        }
        if let Some(s) = &self.sequence {
            probes.push(("sequence", s.ping(ctx)));
        }

        join_all(
            probes
                .into_iter()
                .map(|(name, probe)| async move { (name, ProbeResult::from_result(probe.await)) }),
        )
        .await
        .into_iter()
        .collect()
    }
}
