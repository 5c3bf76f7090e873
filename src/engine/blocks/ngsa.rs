// NGSA block - raises and clears alarms on the alerting collector

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::{collect_fields, default_next, edge, fields_model, model, BlockHeader, FieldKind, SHAPE_INTEGRATION};
use crate::engine::block::{Block, BlockModel, RunContext};
use crate::engine::store::VariableStore;
use crate::integrations::http::{CallContext, HttpClient};
use crate::models::BlockDescriptor;
use crate::{PipelinerError, Result};

pub const TITLE: &str = "ngsa-send-alarm";
pub const SYSTEM: &str = "ngsa";

const STATE_ACTIVE: &str = "ACTIVE";
const STATE_CLEAR: &str = "CLEAR";
const SOURCE_NAME: &str = "Erius";

const FIELDS: &[(&str, FieldKind)] = &[
    ("state", FieldKind::String),
    ("additionalText", FieldKind::String),
    ("perceivedSeverity", FieldKind::Number),
    ("moIdentifier", FieldKind::String),
    ("notificationIdentifier", FieldKind::String),
    ("managedobjectinstance", FieldKind::String),
    ("managedobjectclass", FieldKind::String),
    ("specificProblem", FieldKind::String),
    ("userText", FieldKind::String),
    ("probableCause", FieldKind::String),
    ("additionInformation", FieldKind::String),
    ("eventType", FieldKind::String),
    ("timeout", FieldKind::Number),
];

/// Sends one alarm per run
///
/// An `ACTIVE` alarm with a positive `timeout` (minutes) schedules a `CLEAR`
/// for the same notification id on the runtime. The collector's answer only
/// feeds the ok/fail metric; validation errors of the inputs are fatal.
pub struct NgsaSendBlock {
    header: BlockHeader,
    next: Option<String>,
    http: HttpClient,
    collector_url: String,
}

impl NgsaSendBlock {
    pub fn new(name: &str, descriptor: &BlockDescriptor, http: HttpClient, collector_url: &str) -> Self {
        Self {
            header: BlockHeader::from_descriptor(name, descriptor),
            next: edge(&descriptor.next),
            http,
            collector_url: collector_url.to_string(),
        }
    }

    pub fn registered_model(block_type: &str) -> BlockModel {
        model(block_type, TITLE, fields_model(FIELDS), Vec::new(), default_next(), SHAPE_INTEGRATION)
    }

    fn build_alarm(&self, store: &VariableStore) -> Result<(Map<String, Value>, u64)> {
        let mut alarm = collect_fields(store, &self.header.inputs, FIELDS)?;

        match alarm.get("state").and_then(Value::as_str) {
            Some(STATE_ACTIVE) | Some(STATE_CLEAR) => {}
            other => {
                return Err(PipelinerError::InvalidInput(format!(
                    "unknown alarm state {:?}",
                    other
                )))
            }
        }
        let has_id = alarm
            .get("notificationIdentifier")
            .and_then(Value::as_str)
            .map_or(false, |id| !id.is_empty());
        if !has_id {
            return Err(PipelinerError::InvalidInput("notification id not found".to_string()));
        }

        let timeout = alarm
            .remove("timeout")
            .and_then(|t| t.as_f64())
            .filter(|t| *t > 0.0)
            .map_or(0, |t| t.round() as u64);

        alarm.insert("sourceName".to_string(), json!(SOURCE_NAME));
        alarm.insert("eventTime".to_string(), json!(Utc::now().to_rfc3339()));
        Ok((alarm, timeout))
    }
}

/// Post an alarm; `Ok(false)` when the collector answered anything but 200
async fn send_alarm(http: &HttpClient, url: &str, alarm: &Map<String, Value>, ctx: &CallContext) -> Result<bool> {
    let body = Value::Object(alarm.clone());
    let resp = http.send(SYSTEM, Method::POST, url, Some(&body), ctx).await?;
    if !resp.is_ok() {
        warn!(status = resp.status, url, "alarm collector refused the alarm");
    }
    Ok(resp.is_ok())
}

fn schedule_clear(http: HttpClient, url: String, mut alarm: Map<String, Value>, after: Duration) {
    alarm.insert("state".to_string(), json!(STATE_CLEAR));
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        alarm.insert("eventTime".to_string(), json!(Utc::now().to_rfc3339()));
        match send_alarm(&http, &url, &alarm, &CallContext::background()).await {
            Ok(true) => info!(url = %url, "alarm cleared"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "delayed alarm clear failed"),
        }
    });
}

#[async_trait]
impl Block for NgsaSendBlock {
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

    #[instrument(skip_all, fields(block = %self.header.name))]
    async fn run(&mut self, ctx: &RunContext, store: &VariableStore) -> Result<()> {
        let (alarm, timeout_minutes) = match self.build_alarm(store) {
            Ok(built) => built,
            Err(e) => {
                self.http.metrics().integration_result(SYSTEM, false);
                return Err(e);
            }
        };

        let ok = match send_alarm(&self.http, &self.collector_url, &alarm, &ctx.call_context()).await {
            Ok(ok) => ok,
            Err(PipelinerError::Cancelled) => {
                self.http.metrics().integration_result(SYSTEM, false);
                return Err(PipelinerError::Cancelled);
            }
            Err(e) => {
                warn!(error = %e, "alarm was not delivered");
                false
            }
        };
        self.http.metrics().integration_result(SYSTEM, ok);

        let active = alarm.get("state").and_then(Value::as_str) == Some(STATE_ACTIVE);
        if active && timeout_minutes > 0 {
            info!(minutes = timeout_minutes, "scheduling alarm clear");
            schedule_clear(
                self.http.clone(),
                self.collector_url.clone(),
                alarm,
                Duration::from_secs(timeout_minutes * 60),
            );
        }
        Ok(())
    }

    fn next(&self, _store: &VariableStore) -> Option<String> {
        self.next.clone()
    }
}
