// Scenario definitions - the persisted block graph and its revisions

//! # Scenarios and Versions
//!
//! A `Scenario` is the document users draw in the editor: a list of input and
//! output parameters plus a `pipeline` body made of an entrypoint and a map of
//! block descriptors. The runtime never executes descriptors directly; the
//! loader turns them into executable blocks.
//!
//! ## Wire Format
//!
//! ```json
//! { "id": "…", "version_id": "…", "name": "Linear", "status": 2,
//!   "input":  [ { "name": "Input", "type": "string", "global": "Linear.Input" } ],
//!   "output": [ { "name": "Input", "type": "string", "global": "Block3.Input" } ],
//!   "pipeline": {
//!     "entrypoint": "Block1",
//!     "blocks": { "Block1": { "block_type": "python3", "title": "Block1", "x": 0, "y": 0,
//!                             "input": [], "output": [], "next": "Block2" } } } }
//! ```
//!
//! `status` travels as an integer; block maps use a `BTreeMap` so iteration
//! order is canonical and persisted step sequences replay identically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{PipelinerError, Result};

/// Successor slot name reserved for the default edge
pub const NEXT_SLOT: &str = "next";

/// Lifecycle status of a scenario version
///
/// Serialized as the integer codes the editor and storage agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ScenarioStatus {
    Draft,
    Approved,
    Deleted,
    Rejected,
    OnApprove,
}

impl From<ScenarioStatus> for i32 {
    fn from(status: ScenarioStatus) -> Self {
        match status {
            ScenarioStatus::Draft => 1,
            ScenarioStatus::Approved => 2,
            ScenarioStatus::Deleted => 3,
            ScenarioStatus::Rejected => 4,
            ScenarioStatus::OnApprove => 5,
        }
    }
}

impl TryFrom<i32> for ScenarioStatus {
    type Error = String;

    fn try_from(code: i32) -> std::result::Result<Self, Self::Error> {
        match code {
            1 => Ok(ScenarioStatus::Draft),
            2 => Ok(ScenarioStatus::Approved),
            3 => Ok(ScenarioStatus::Deleted),
            4 => Ok(ScenarioStatus::Rejected),
            5 => Ok(ScenarioStatus::OnApprove),
            other => Err(format!("unknown scenario status {}", other)),
        }
    }
}

impl Default for ScenarioStatus {
    fn default() -> Self {
        ScenarioStatus::Draft
    }
}

/// Version status is the same state machine as the scenario status
pub type VersionStatus = ScenarioStatus;

/// A typed parameter descriptor
///
/// `global` is the fully qualified store key (`scope.key`) the value is read
/// from (inputs) or written to (outputs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionValue {
    pub name: String,

    #[serde(rename = "type")]
    pub value_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<String>,
}

impl FunctionValue {
    pub fn new(name: impl Into<String>, value_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: value_type.into(),
            global: None,
        }
    }

    pub fn with_global(mut self, global: impl Into<String>) -> Self {
        self.global = Some(global.into());
        self
    }
}

/// One block of the graph as the editor stores it
///
/// `block_type` selects the family (`python3`, `internal`, `term`, `go`,
/// `scenario`); for the internal family `title` selects the concrete kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    pub block_type: String,
    pub title: String,

    #[serde(default)]
    pub x: i64,
    #[serde(default)]
    pub y: i64,

    #[serde(default)]
    pub input: Vec<FunctionValue>,
    #[serde(default)]
    pub output: Vec<FunctionValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_true: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_false: Option<String>,

    // Loop edges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl BlockDescriptor {
    pub fn new(block_type: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            block_type: block_type.into(),
            title: title.into(),
            x: 0,
            y: 0,
            input: Vec::new(),
            output: Vec::new(),
            next: None,
            on_true: None,
            on_false: None,
            body: None,
            after: None,
        }
    }

    /// Every successor this descriptor names, keyed by edge name
    ///
    /// Empty names are dropped: an empty successor means "terminate".
    pub fn successors(&self) -> Vec<(&'static str, &str)> {
        [
            (NEXT_SLOT, &self.next),
            ("on_true", &self.on_true),
            ("on_false", &self.on_false),
            ("body", &self.body),
            ("after", &self.after),
        ]
        .into_iter()
        .filter_map(|(edge, target)| match target.as_deref() {
            Some(name) if !name.is_empty() => Some((edge, name)),
            _ => None,
        })
        .collect()
    }

    /// Local name → global key map for inputs (descriptors without `global` are skipped)
    pub fn input_map(&self) -> BTreeMap<String, String> {
        alias_map(&self.input)
    }

    pub fn output_map(&self) -> BTreeMap<String, String> {
        alias_map(&self.output)
    }
}

fn alias_map(values: &[FunctionValue]) -> BTreeMap<String, String> {
    values
        .iter()
        .filter_map(|v| v.global.as_ref().map(|g| (v.name.clone(), g.clone())))
        .collect()
}

/// The executable body of a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineBody {
    pub entrypoint: String,

    #[serde(default)]
    pub blocks: BTreeMap<String, BlockDescriptor>,
}

/// A scenario version document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: Uuid,
    pub version_id: Uuid,
    pub name: String,

    #[serde(default)]
    pub status: ScenarioStatus,

    #[serde(default)]
    pub input: Vec<FunctionValue>,
    #[serde(default)]
    pub output: Vec<FunctionValue>,

    pub pipeline: PipelineBody,
}

impl Scenario {
    /// Parse a scenario document, mapping any JSON failure to `PipelineParse`
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| PipelinerError::PipelineParse(e.to_string()))
    }

    /// Store key the given input parameter is seeded under
    pub fn param_key(&self, param: &str) -> String {
        format!("{}.{}", self.name, param)
    }
}

/// A persisted revision of a scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub version_id: Uuid,
    pub pipeline_id: Uuid,
    pub status: VersionStatus,
    pub author: String,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_rejected: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version: Option<Uuid>,

    /// The scenario document of this revision
    pub content: Scenario,
}

impl Version {
    pub fn new_draft(content: Scenario, author: impl Into<String>, parent: Option<Uuid>) -> Self {
        Self {
            version_id: content.version_id,
            pipeline_id: content.id,
            status: ScenarioStatus::Draft,
            author: author.into(),
            created_at: Utc::now(),
            approved_at: None,
            comment_rejected: None,
            parent_version: parent,
            content,
        }
    }
}
