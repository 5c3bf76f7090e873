// Remedy blocks - incident, work and problem tickets on the Remedy gateway

//! Six variants share one block type. Each variant is a static field table
//! (field name → [`FieldKind`]), an HTTP method and a gateway path; the block
//! marshals the declared inputs found in the store into a JSON document
//! keyed by field name and sends it.
//!
//! A non-200 answer records a failed push and, unless the gateway is
//! configured with `fail_on_bad_status`, lets the task continue.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

use super::{collect_fields, default_next, edge, fields_model, model, BlockHeader, FieldKind, SHAPE_INTEGRATION};
use crate::engine::block::{Block, BlockModel, RunContext};
use crate::engine::store::VariableStore;
use crate::integrations::http::{expect_ok, join_url, HttpClient};
use crate::models::BlockDescriptor;
use crate::{PipelinerError, Result};

pub const SYSTEM: &str = "remedy";

use super::FieldKind::{Number as N, String as S, Time as T};

const INCIDENT_FIELDS: &[(&str, FieldKind)] = &[
    ("extID", S),
    ("operationID", S),
    ("scale", N),
    ("influence", N),
    ("urgency", N),
    ("objPriority", N),
    ("kpi", N),
    ("regtime", T),
    ("executorLogin", S),
    ("executorGroupID", S),
    ("placeAddress", S),
    ("theme", S),
    ("subject", S),
    ("region", S),
    ("busDesc", S),
    ("niossID", S),
    ("ne", S),
    ("impactDesc", S),
    ("supervisorGroupID", S),
    ("supervisorLogin", S),
    ("initiatorLogin", S),
    ("shortDesc", S),
    ("serviceSiebel", S),
    ("respZone", S),
    ("extDesc", S),
    ("alarmMessage", S),
    ("stopServDat", T),
    ("mrClusterF1", N),
    ("mrClusterF2", N),
    ("mrClusterF3", N),
    ("mrClusterF4", N),
    ("inReport", N),
    ("knownProblem", N),
    ("neAlias", S),
    ("neTimeRoad", N),
    ("notifyService", N),
    ("notifyServiceTime", T),
    ("siebelTimeRoad", N),
    ("siebelScale2", N),
    ("termSolution", T),
    ("deadlineExceedCause", S),
    ("neVendor", S),
    ("neSubsystem", S),
    ("neType", S),
    ("neName", S),
    ("neSegment", S),
    ("neAddress", S),
    ("neSite", S),
    ("neSubtype", S),
    ("neServiceType", S),
];

const INCIDENT_UPDATE_FIELDS: &[(&str, FieldKind)] = &[
    ("requestID", S),
    ("state", S),
    ("cause", S),
    ("causeClassif", S),
    ("solution", S),
    ("closureCode", S),
    ("FixTime", S),
    ("parentID", N),
    ("category", N),
    ("downtime", N),
];

const WORK_CREATE_FIELDS: &[(&str, FieldKind)] = &[
    ("workType", S),
    ("classificatorCause", S),
    ("status", S),
    ("priority", S),
    ("shortDescription", S),
    ("ne", S),
    ("serviceType", S),
    ("serviceImpactCls", S),
    ("planStart", S),
    ("planBegRestrictService", S),
    ("planEndRestrictService", S),
    ("deadLine", S),
    ("executorGroupID", S),
    ("executorLogin", S),
    ("initiatorLogin", S),
    ("supervisorLogin", S),
    ("supervisorGroupID", S),
    ("hwSubSystem", S),
    ("context", S),
    ("description", S),
    ("extID", S),
    ("incID", S),
    ("siID", S),
    ("inReport", S),
    ("getSupplier", S),
    ("notifyService", S),
    ("operationID", S),
    ("hwRegion", S),
    ("mainNIOSSID", S),
    ("module", S),
    ("fileIndex", S),
    ("fileTimestamp", S),
    ("fileURL", S),
    ("fileName", S),
    ("fileSize", N),
    ("fileAuthor", S),
];

const WORK_UPDATE_FIELDS: &[(&str, FieldKind)] = &[
    ("extID", S),
    ("requestID", S),
    ("operationID", S),
    ("status", S),
    ("priority", S),
    ("planStart", S),
    ("deadLine", S),
    ("start", S),
    ("finish", S),
    ("executorGroupID", S),
    ("executorLogin", S),
    ("description", S),
    ("mainNIOSSID", S),
    ("completionCode", S),
    ("fileIndex", S),
    ("fileTimestamp", S),
    ("fileURL", S),
    ("fileName", S),
    ("fileSize", N),
    ("fileAuthor", S),
];

const PROBLEM_FIELDS: &[(&str, FieldKind)] = &[
    ("extID", S),
    ("operationID", S),
    ("source", S),
    ("status", N),
    ("priority", N),
    ("region", S),
    ("classificatorDescription", S),
    ("serviceImpactCls", S),
    ("description", S),
    ("classificatorCause", S),
    ("classificatorSolution", S),
    ("solution", S),
    ("solutionCode", N),
    ("responsibilityZone", S),
    ("eventTime", S),
    ("fixTime", S),
    ("deadline", S),
    ("solutionPlanTime", S),
    ("flagInvestment", N),
    ("closureCode", N),
    ("initiatorLogin", S),
    ("executorLogin", S),
    ("executorGroupID", S),
    ("supervisorLogin", S),
    ("supervisorGroupID", S),
    ("neNiossID", S),
    ("neSubsystem", S),
];

const PROBLEM_UPDATE_FIELDS: &[(&str, FieldKind)] = &[("requestID", S)];

/// The six ticket operations of the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemedyKind {
    CreateIncident,
    UpdateIncident,
    CreateWork,
    UpdateWork,
    CreateProblem,
    UpdateProblem,
}

impl RemedyKind {
    pub const ALL: [RemedyKind; 6] = [
        RemedyKind::CreateIncident,
        RemedyKind::UpdateIncident,
        RemedyKind::CreateWork,
        RemedyKind::UpdateWork,
        RemedyKind::CreateProblem,
        RemedyKind::UpdateProblem,
    ];

    pub fn from_title(title: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.title() == title)
    }

    pub fn title(&self) -> &'static str {
        match self {
            RemedyKind::CreateIncident => "remedy-send-createmi",
            RemedyKind::UpdateIncident => "remedy-send-updatemi",
            RemedyKind::CreateWork => "remedy-send-creatework",
            RemedyKind::UpdateWork => "remedy-send-updatework",
            RemedyKind::CreateProblem => "remedy-send-createproblem",
            RemedyKind::UpdateProblem => "remedy-send-updateproblem",
        }
    }

    pub fn method(&self) -> Method {
        match self {
            RemedyKind::UpdateIncident => Method::PUT,
            _ => Method::POST,
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            RemedyKind::CreateIncident => "api/remedy/incident/create",
            RemedyKind::UpdateIncident => "api/remedy/incident/update",
            RemedyKind::CreateWork => "api/remedy/work/create",
            RemedyKind::UpdateWork => "api/remedy/work/update",
            RemedyKind::CreateProblem => "api/remedy/problem/create",
            RemedyKind::UpdateProblem => "api/remedy/problem/update",
        }
    }

    /// Field tables; update variants extend their create table
    pub fn field_tables(&self) -> Vec<&'static [(&'static str, FieldKind)]> {
        match self {
            RemedyKind::CreateIncident => vec![INCIDENT_FIELDS],
            RemedyKind::UpdateIncident => vec![INCIDENT_FIELDS, INCIDENT_UPDATE_FIELDS],
            RemedyKind::CreateWork => vec![WORK_CREATE_FIELDS],
            RemedyKind::UpdateWork => vec![WORK_UPDATE_FIELDS],
            RemedyKind::CreateProblem => vec![PROBLEM_FIELDS],
            RemedyKind::UpdateProblem => vec![PROBLEM_FIELDS, PROBLEM_UPDATE_FIELDS],
        }
    }

    pub fn fields(&self) -> Vec<(&'static str, FieldKind)> {
        self.field_tables().into_iter().flatten().copied().collect()
    }
}

pub struct RemedyBlock {
    header: BlockHeader,
    kind: RemedyKind,
    next: Option<String>,
    http: HttpClient,
    url: String,
    fail_on_bad_status: bool,
}

impl RemedyBlock {
    pub fn new(
        name: &str,
        descriptor: &BlockDescriptor,
        kind: RemedyKind,
        http: HttpClient,
        remedy_base: &str,
        fail_on_bad_status: bool,
    ) -> Self {
        Self {
            header: BlockHeader::from_descriptor(name, descriptor),
            kind,
            next: edge(&descriptor.next),
            http,
            url: join_url(remedy_base, kind.path()),
            fail_on_bad_status,
        }
    }

    pub fn registered_model(block_type: &str, kind: RemedyKind) -> BlockModel {
        model(
            block_type,
            kind.title(),
            fields_model(&kind.fields()),
            Vec::new(),
            default_next(),
            SHAPE_INTEGRATION,
        )
    }

    /// `Ok(true)` when the gateway accepted the document
    async fn push(&self, ctx: &RunContext, store: &VariableStore) -> Result<bool> {
        let document = collect_fields(store, &self.header.inputs, &self.kind.fields())?;
        let body = Value::Object(document);

        let resp = self
            .http
            .send(SYSTEM, self.kind.method(), &self.url, Some(&body), &ctx.call_context())
            .await?;
        if resp.is_ok() {
            info!(url = %self.url, "remedy accepted the ticket");
            return Ok(true);
        }
        if self.fail_on_bad_status {
            expect_ok(SYSTEM, &resp)?;
        }
        warn!(
            url = %self.url,
            status = resp.status,
            body = %String::from_utf8_lossy(&resp.body),
            "remedy answered with a bad status, continuing"
        );
        Ok(false)
    }
}

#[async_trait]
impl Block for RemedyBlock {
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
        Self::registered_model(&self.header.block_type, self.kind)
    }

    #[instrument(skip_all, fields(block = %self.header.name, kind = self.kind.title()))]
    async fn run(&mut self, ctx: &RunContext, store: &VariableStore) -> Result<()> {
        let outcome = self.push(ctx, store).await;
        self.http
            .metrics()
            .integration_result(SYSTEM, matches!(outcome, Ok(true)));
        outcome.map(|_| ())
    }

    fn next(&self, _store: &VariableStore) -> Option<String> {
        self.next.clone()
    }
}

impl std::fmt::Display for RemedyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.title())
    }
}

impl std::str::FromStr for RemedyKind {
    type Err = PipelinerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_title(s).ok_or_else(|| PipelinerError::UnknownBlockType(s.to_string()))
    }
}
