// Task and step records - one run of a version and its audit trail

//! # Tasks and Steps
//!
//! A `Task` is created when a run is requested and finishes exactly once, as
//! `Finished` or `Error`. Every block execution appends a `Step`: it is
//! written before the block runs and completed after, so a crashed task still
//! shows which block it was in. The last step of a task is the restore point
//! for debug sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Run status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created for a debug session, no step executed yet
    Created,
    Running,
    Finished,
    Error,
    /// Paused on a breakpoint or after a step-over
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Error)
    }
}

/// A single execution of a scenario version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub version_id: Uuid,
    pub author: String,
    pub is_debug: bool,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Initial input parameters (`{name → value}`)
    #[serde(default)]
    pub parameters: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_number: Option<String>,

    /// Set for tasks spawned by a sub-pipeline block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task: Option<Uuid>,
}

impl Task {
    pub fn new(version_id: Uuid, author: impl Into<String>, is_debug: bool, parameters: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            version_id,
            author: author.into(),
            is_debug,
            status: if is_debug { TaskStatus::Created } else { TaskStatus::Running },
            started_at: Utc::now(),
            finished_at: None,
            parameters,
            work_number: None,
            parent_task: None,
        }
    }
}

/// Copy of the variable store embedded into a step record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub values: BTreeMap<String, Value>,
    pub steps: Vec<String>,
    pub errors: Vec<String>,
}

/// Outcome of a step record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Written before the block started, not completed yet
    Running,
    /// Breakpoint hit; the block did not run
    Paused,
    Finished,
    Error,
}

/// One block execution within a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub task_id: Uuid,
    /// Dense, strictly increasing within a task (starts at 0)
    pub index: u64,
    pub block_name: String,
    pub block_type: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Private block state, block name → opaque state document
    #[serde(default)]
    pub state: BTreeMap<String, Value>,

    /// Public dataflow values at this step
    #[serde(default)]
    pub snapshot: StoreSnapshot,

    #[serde(default)]
    pub break_points: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything needed to append a step record
#[derive(Debug, Clone)]
pub struct NewStep {
    pub task_id: Uuid,
    pub index: u64,
    pub block_name: String,
    pub block_type: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub state: BTreeMap<String, Value>,
    pub snapshot: StoreSnapshot,
    pub break_points: BTreeSet<String>,
    pub error: Option<String>,
}

impl NewStep {
    pub fn into_step(self) -> Step {
        Step {
            id: Uuid::new_v4(),
            task_id: self.task_id,
            index: self.index,
            block_name: self.block_name,
            block_type: self.block_type,
            status: self.status,
            started_at: self.started_at,
            finished_at: None,
            state: self.state,
            snapshot: self.snapshot,
            break_points: self.break_points,
            error: self.error,
        }
    }
}

/// Debug action requested for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugAction {
    /// Execute exactly one block, then stop
    StepOver,
    /// Execute until a breakpoint or termination
    Resume,
}
