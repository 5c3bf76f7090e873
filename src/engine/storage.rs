// Storage abstraction for the scenario runtime
// This defines the interface for persisting scenarios, versions, tasks and steps

//! # Storage Abstraction Layer
//!
//! The engine never talks to a database directly. Everything it persists
//! goes through the [`Storage`] trait:
//!
//! - **Tasks and steps**: a task record plus its dense, ordered step records
//! - **Pipelines and versions**: the version state machine
//!   (draft → on-approve → approved | rejected)
//! - **Tags and module usage**: auxiliary catalog queries
//!
//! [`InMemoryStorage`] is the default backend for development, tests and
//! single-process deployments.
//!
//! ## Version History
//!
//! Every approval or rollback appends the version to the pipeline's history.
//! The last history entry is the version a run of the pipeline executes;
//! approving a new version archives the previous approved one as `Deleted`,
//! so at most one version per pipeline is approved at a time.
//!
//! ## Rust Learning Notes:
//!
//! ### Result<Option<T>>
//! Getters return `Ok(None)` for "no such record" and `Err` only when the
//! operation itself failed. Callers pick the error kind that fits their
//! context (`GetTask`, `GetVersion`, …).
//!
//! ### Poisoned locks
//! `RwLock::read()` fails only if another thread panicked while holding the
//! lock. We recover the guard with `PoisonError::into_inner`: every write
//! below leaves the maps consistent before it can panic.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::models::{NewStep, Scenario, Step, StepStatus, StoreSnapshot, Task, TaskStatus, Version, VersionStatus};
use crate::{PipelinerError, Result};

/// A pipeline as the catalog knows it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub id: Uuid,
    pub name: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// Completion data of a step record
#[derive(Debug, Clone)]
pub struct StepUpdate {
    pub finished_at: DateTime<Utc>,
    pub status: StepStatus,
    pub state: BTreeMap<String, Value>,
    pub snapshot: StoreSnapshot,
    pub error: Option<String>,
}

/// Storage trait for everything the runtime persists
///
/// ## Rust Learning Notes:
///
/// ### Trait Bounds
/// `Send + Sync` lets an `Arc<dyn Storage>` be shared by every task the
/// runtime executes concurrently.
#[async_trait]
pub trait Storage: Send + Sync {
    // Tasks

    async fn create_task(&self, task: Task) -> Result<Task>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;

    /// Terminal statuses also stamp `finished_at`
    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()>;

    async fn set_work_number(&self, id: Uuid, work_number: String) -> Result<()>;

    /// Tasks, optionally only those of one version, oldest first
    async fn list_tasks(&self, version_id: Option<Uuid>) -> Result<Vec<Task>>;

    /// Steps of a task ordered by index
    async fn get_task_steps(&self, task_id: Uuid) -> Result<Vec<Step>>;

    /// Append a step record; its index must be the next dense index of the task
    async fn append_step(&self, step: NewStep) -> Result<Uuid>;

    async fn finish_step(&self, step_id: Uuid, update: StepUpdate) -> Result<()>;

    // Pipelines and versions

    /// Register a pipeline together with its first draft
    async fn create_pipeline(&self, record: PipelineRecord, draft: Version) -> Result<()>;

    /// The current approved scenario of a pipeline
    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Scenario>>;

    async fn get_pipeline_record(&self, id: Uuid) -> Result<Option<PipelineRecord>>;

    async fn get_pipeline_version(&self, version_id: Uuid) -> Result<Option<Version>>;

    /// All versions of a pipeline, oldest first
    async fn list_versions(&self, pipeline_id: Uuid) -> Result<Vec<Version>>;

    async fn get_versions_by_status(&self, status: VersionStatus, author: Option<&str>) -> Result<Vec<Version>>;

    /// Every version that is not archived, of pipelines that are not deleted
    async fn get_worked_versions(&self) -> Result<Vec<Version>>;

    /// Scenarios eligible as sub-pipelines: the current approved version of each pipeline
    async fn get_executable_scenarios(&self) -> Result<Vec<Scenario>>;

    async fn get_executable_by_name(&self, name: &str) -> Result<Option<Scenario>>;

    async fn create_version(&self, version: Version) -> Result<()>;

    async fn update_draft(&self, version_id: Uuid, content: Scenario) -> Result<()>;

    async fn send_to_approve(&self, version_id: Uuid) -> Result<()>;

    async fn switch_approved(&self, pipeline_id: Uuid, version_id: Uuid, author: &str) -> Result<()>;

    async fn switch_rejected(&self, version_id: Uuid, comment: &str, author: &str) -> Result<()>;

    /// Make a previously approved version current again
    async fn rollback_version(&self, pipeline_id: Uuid, version_id: Uuid) -> Result<()>;

    async fn delete_version(&self, version_id: Uuid) -> Result<()>;

    async fn delete_pipeline(&self, id: Uuid) -> Result<()>;

    // Tags and usage

    async fn attach_tag(&self, pipeline_id: Uuid, tag: &str) -> Result<()>;

    async fn detach_tag(&self, pipeline_id: Uuid, tag: &str) -> Result<()>;

    async fn get_pipeline_tags(&self, pipeline_id: Uuid) -> Result<Vec<String>>;

    /// Pipelines whose current version calls the given function module
    async fn pipelines_using_module(&self, module: &str) -> Result<Vec<Uuid>>;
}

#[derive(Debug, Default)]
struct PipelineEntry {
    record: Option<PipelineRecord>,
    /// (version, date) of every approval and rollback
    history: Vec<(Uuid, DateTime<Utc>)>,
    tags: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Catalog {
    pipelines: HashMap<Uuid, PipelineEntry>,
    versions: HashMap<Uuid, Version>,
}

impl Catalog {
    fn live_record(&self, id: Uuid) -> Option<&PipelineRecord> {
        self.pipelines.get(&id).and_then(|p| p.record.as_ref())
    }

    fn versions_of(&self, pipeline_id: Uuid) -> Vec<&Version> {
        let mut versions: Vec<&Version> = self
            .versions
            .values()
            .filter(|v| v.pipeline_id == pipeline_id)
            .collect();
        versions.sort_by_key(|v| v.created_at);
        versions
    }

    fn current_version(&self, pipeline_id: Uuid) -> Option<&Version> {
        let entry = self.pipelines.get(&pipeline_id)?;
        entry.record.as_ref()?;
        let (version_id, _) = entry.history.last()?;
        self.versions
            .get(version_id)
            .filter(|v| v.status == VersionStatus::Approved)
    }

    fn version_mut(&mut self, version_id: Uuid) -> Result<&mut Version> {
        self.versions
            .get_mut(&version_id)
            .ok_or_else(|| PipelinerError::GetVersion(format!("no version {}", version_id)))
    }

    fn archive_approved(&mut self, pipeline_id: Uuid, except: Uuid) {
        for v in self.versions.values_mut() {
            if v.pipeline_id == pipeline_id && v.version_id != except && v.status == VersionStatus::Approved {
                v.status = VersionStatus::Deleted;
            }
        }
    }
}

/// Scenario document of a version with its identity and status filled in
fn scenario_of(version: &Version) -> Scenario {
    let mut content = version.content.clone();
    content.id = version.pipeline_id;
    content.version_id = version.version_id;
    content.status = version.status;
    content
}

#[derive(Debug, Default)]
struct TaskTable {
    tasks: HashMap<Uuid, Task>,
    steps: HashMap<Uuid, Vec<Step>>,
    /// step id → (task id, position)
    step_index: HashMap<Uuid, (Uuid, usize)>,
}

/// In-memory storage implementation for development and testing
///
/// ## Limitations
///
/// - **Not persistent**: data is lost when the process restarts
/// - **Not distributed**: one process only
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    catalog: RwLock<Catalog>,
    tasks: RwLock<TaskTable>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn catalog(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn catalog_mut(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> RwLockReadGuard<'_, TaskTable> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks_mut(&self) -> RwLockWriteGuard<'_, TaskTable> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_task(&self, task: Task) -> Result<Task> {
        let mut table = self.tasks_mut();
        if table.tasks.contains_key(&task.id) {
            return Err(anyhow!("task {} already exists", task.id).into());
        }
        table.steps.insert(task.id, Vec::new());
        table.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.tasks().tasks.get(&id).cloned())
    }

    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        let mut table = self.tasks_mut();
        let task = table
            .tasks
            .get_mut(&id)
            .ok_or_else(|| PipelinerError::GetTask(format!("no task {}", id)))?;
        task.status = status;
        if status.is_terminal() {
            task.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_work_number(&self, id: Uuid, work_number: String) -> Result<()> {
        let mut table = self.tasks_mut();
        let task = table
            .tasks
            .get_mut(&id)
            .ok_or_else(|| PipelinerError::GetTask(format!("no task {}", id)))?;
        task.work_number = Some(work_number);
        Ok(())
    }

    async fn list_tasks(&self, version_id: Option<Uuid>) -> Result<Vec<Task>> {
        let table = self.tasks();
        let mut tasks: Vec<Task> = table
            .tasks
            .values()
            .filter(|t| version_id.map_or(true, |v| t.version_id == v))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.started_at);
        Ok(tasks)
    }

    async fn get_task_steps(&self, task_id: Uuid) -> Result<Vec<Step>> {
        Ok(self.tasks().steps.get(&task_id).cloned().unwrap_or_default())
    }

    async fn append_step(&self, step: NewStep) -> Result<Uuid> {
        let mut table = self.tasks_mut();
        if !table.tasks.contains_key(&step.task_id) {
            return Err(PipelinerError::GetTask(format!("no task {}", step.task_id)));
        }

        let steps = table.steps.entry(step.task_id).or_default();
        let expected = steps.len() as u64;
        if step.index != expected {
            return Err(anyhow!(
                "step index {} of task {} breaks the sequence, expected {}",
                step.index,
                step.task_id,
                expected
            )
            .into());
        }

        let task_id = step.task_id;
        let record = step.into_step();
        let id = record.id;
        let position = steps.len();
        steps.push(record);
        table.step_index.insert(id, (task_id, position));
        Ok(id)
    }

    async fn finish_step(&self, step_id: Uuid, update: StepUpdate) -> Result<()> {
        let mut table = self.tasks_mut();
        let (task_id, position) = *table
            .step_index
            .get(&step_id)
            .ok_or_else(|| anyhow!("no step {}", step_id))?;
        let step = table
            .steps
            .get_mut(&task_id)
            .and_then(|steps| steps.get_mut(position))
            .ok_or_else(|| anyhow!("step {} lost its task {}", step_id, task_id))?;

        step.finished_at = Some(update.finished_at);
        step.status = update.status;
        step.state = update.state;
        step.snapshot = update.snapshot;
        step.error = update.error;
        Ok(())
    }

    async fn create_pipeline(&self, record: PipelineRecord, draft: Version) -> Result<()> {
        let mut catalog = self.catalog_mut();

        let name_used = catalog
            .pipelines
            .values()
            .filter_map(|p| p.record.as_ref())
            .any(|r| r.name == record.name);
        if name_used {
            return Err(PipelinerError::PipelineNameUsed(record.name));
        }
        if catalog.pipelines.contains_key(&record.id) {
            return Err(PipelinerError::PipelineCreate(format!("pipeline {} already exists", record.id)));
        }
        if draft.pipeline_id != record.id {
            return Err(PipelinerError::PipelineCreate(
                "draft belongs to another pipeline".to_string(),
            ));
        }

        catalog.versions.insert(draft.version_id, draft);
        catalog.pipelines.insert(
            record.id,
            PipelineEntry {
                record: Some(record),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Scenario>> {
        Ok(self.catalog().current_version(id).map(scenario_of))
    }

    async fn get_pipeline_record(&self, id: Uuid) -> Result<Option<PipelineRecord>> {
        Ok(self.catalog().live_record(id).cloned())
    }

    async fn get_pipeline_version(&self, version_id: Uuid) -> Result<Option<Version>> {
        let catalog = self.catalog();
        Ok(catalog.versions.get(&version_id).map(|v| {
            let mut v = v.clone();
            v.content = scenario_of(&v);
            v
        }))
    }

    async fn list_versions(&self, pipeline_id: Uuid) -> Result<Vec<Version>> {
        Ok(self
            .catalog()
            .versions_of(pipeline_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn get_versions_by_status(&self, status: VersionStatus, author: Option<&str>) -> Result<Vec<Version>> {
        let catalog = self.catalog();
        let mut versions: Vec<Version> = catalog
            .versions
            .values()
            .filter(|v| v.status == status)
            .filter(|v| author.map_or(true, |a| v.author == a))
            .filter(|v| catalog.live_record(v.pipeline_id).is_some())
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.created_at);
        Ok(versions)
    }

    async fn get_worked_versions(&self) -> Result<Vec<Version>> {
        let catalog = self.catalog();
        let mut versions: Vec<Version> = catalog
            .versions
            .values()
            .filter(|v| v.status != VersionStatus::Deleted)
            .filter(|v| catalog.live_record(v.pipeline_id).is_some())
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.created_at);
        Ok(versions)
    }

    async fn get_executable_scenarios(&self) -> Result<Vec<Scenario>> {
        let catalog = self.catalog();
        let mut scenarios: Vec<(DateTime<Utc>, Scenario)> = catalog
            .pipelines
            .keys()
            .filter_map(|id| catalog.current_version(*id))
            .map(|v| (v.created_at, scenario_of(v)))
            .collect();
        scenarios.sort_by_key(|(created, _)| *created);
        Ok(scenarios.into_iter().map(|(_, s)| s).collect())
    }

    async fn get_executable_by_name(&self, name: &str) -> Result<Option<Scenario>> {
        let catalog = self.catalog();
        let pipeline_id = catalog
            .pipelines
            .iter()
            .find(|(_, p)| p.record.as_ref().map_or(false, |r| r.name == name))
            .map(|(id, _)| *id);
        Ok(pipeline_id
            .and_then(|id| catalog.current_version(id))
            .map(scenario_of))
    }

    async fn create_version(&self, version: Version) -> Result<()> {
        let mut catalog = self.catalog_mut();
        if catalog.live_record(version.pipeline_id).is_none() {
            return Err(PipelinerError::GetPipeline(format!("no pipeline {}", version.pipeline_id)));
        }
        let has_draft = catalog
            .versions_of(version.pipeline_id)
            .iter()
            .any(|v| v.status == VersionStatus::Draft);
        if has_draft {
            return Err(PipelinerError::PipelineHasDraft(version.pipeline_id.to_string()));
        }
        catalog.versions.insert(version.version_id, version);
        Ok(())
    }

    async fn update_draft(&self, version_id: Uuid, content: Scenario) -> Result<()> {
        let mut catalog = self.catalog_mut();
        let (pipeline_id, status) = {
            let version = catalog.version_mut(version_id)?;
            (version.pipeline_id, version.status)
        };
        match status {
            VersionStatus::Draft => {}
            // Editing a rejected version reopens it as the pipeline's draft
            VersionStatus::Rejected => {
                let has_draft = catalog
                    .versions_of(pipeline_id)
                    .iter()
                    .any(|v| v.status == VersionStatus::Draft);
                if has_draft {
                    return Err(PipelinerError::PipelineHasDraft(pipeline_id.to_string()));
                }
            }
            _ => {
                return Err(PipelinerError::PipelineWrite(format!(
                    "version {} is not a draft",
                    version_id
                )))
            }
        }
        let version = catalog.version_mut(version_id)?;
        version.status = VersionStatus::Draft;
        version.content = content;
        Ok(())
    }

    async fn send_to_approve(&self, version_id: Uuid) -> Result<()> {
        let mut catalog = self.catalog_mut();
        let version = catalog.version_mut(version_id)?;
        if !matches!(version.status, VersionStatus::Draft | VersionStatus::Rejected) {
            return Err(PipelinerError::Approve(format!(
                "only a draft can be sent to approve, {} is {:?}",
                version_id, version.status
            )));
        }
        version.status = VersionStatus::OnApprove;
        Ok(())
    }

    async fn switch_approved(&self, pipeline_id: Uuid, version_id: Uuid, author: &str) -> Result<()> {
        let mut catalog = self.catalog_mut();
        if catalog.live_record(pipeline_id).is_none() {
            return Err(PipelinerError::GetPipeline(format!("no pipeline {}", pipeline_id)));
        }

        let now = Utc::now();
        {
            let version = catalog.version_mut(version_id)?;
            if version.pipeline_id != pipeline_id {
                return Err(PipelinerError::Approve(format!(
                    "version {} does not belong to pipeline {}",
                    version_id, pipeline_id
                )));
            }
            if version.status != VersionStatus::OnApprove {
                return Err(PipelinerError::Approve(format!(
                    "version {} is not on approve",
                    version_id
                )));
            }
            version.status = VersionStatus::Approved;
            version.approved_at = Some(now);
            version.comment_rejected = None;
            if version.author.is_empty() {
                version.author = author.to_string();
            }
        }

        catalog.archive_approved(pipeline_id, version_id);
        if let Some(entry) = catalog.pipelines.get_mut(&pipeline_id) {
            entry.history.push((version_id, now));
        }
        Ok(())
    }

    async fn switch_rejected(&self, version_id: Uuid, comment: &str, _author: &str) -> Result<()> {
        let mut catalog = self.catalog_mut();
        let version = catalog.version_mut(version_id)?;
        if version.status != VersionStatus::OnApprove {
            return Err(PipelinerError::Approve(format!(
                "version {} is not on approve",
                version_id
            )));
        }
        version.status = VersionStatus::Rejected;
        version.comment_rejected = Some(comment.to_string());
        Ok(())
    }

    async fn rollback_version(&self, pipeline_id: Uuid, version_id: Uuid) -> Result<()> {
        let mut catalog = self.catalog_mut();
        let in_history = catalog
            .pipelines
            .get(&pipeline_id)
            .map_or(false, |p| p.history.iter().any(|(v, _)| *v == version_id));
        if !in_history {
            return Err(PipelinerError::Approve(format!(
                "version {} was never approved for pipeline {}",
                version_id, pipeline_id
            )));
        }

        catalog.version_mut(version_id)?.status = VersionStatus::Approved;
        catalog.archive_approved(pipeline_id, version_id);
        if let Some(entry) = catalog.pipelines.get_mut(&pipeline_id) {
            entry.history.push((version_id, Utc::now()));
        }
        Ok(())
    }

    async fn delete_version(&self, version_id: Uuid) -> Result<()> {
        let mut catalog = self.catalog_mut();
        let status = catalog
            .versions
            .get(&version_id)
            .map(|v| v.status)
            .ok_or_else(|| PipelinerError::GetVersion(format!("no version {}", version_id)))?;
        if status == VersionStatus::Approved {
            return Err(PipelinerError::PipelineDelete(format!(
                "version {} is approved",
                version_id
            )));
        }
        catalog.versions.remove(&version_id);
        Ok(())
    }

    async fn delete_pipeline(&self, id: Uuid) -> Result<()> {
        let mut catalog = self.catalog_mut();
        let entry = catalog
            .pipelines
            .get_mut(&id)
            .filter(|p| p.record.is_some())
            .ok_or_else(|| PipelinerError::GetPipeline(format!("no pipeline {}", id)))?;

        // The entry stays as a tombstone so history lookups of old tasks still resolve
        entry.record = None;
        entry.tags.clear();
        for v in catalog.versions.values_mut().filter(|v| v.pipeline_id == id) {
            v.status = VersionStatus::Deleted;
        }
        Ok(())
    }

    async fn attach_tag(&self, pipeline_id: Uuid, tag: &str) -> Result<()> {
        let mut catalog = self.catalog_mut();
        let entry = catalog
            .pipelines
            .get_mut(&pipeline_id)
            .filter(|p| p.record.is_some())
            .ok_or_else(|| PipelinerError::TagAttach(format!("no pipeline {}", pipeline_id)))?;
        entry.tags.insert(tag.to_string());
        Ok(())
    }

    async fn detach_tag(&self, pipeline_id: Uuid, tag: &str) -> Result<()> {
        let mut catalog = self.catalog_mut();
        let entry = catalog
            .pipelines
            .get_mut(&pipeline_id)
            .filter(|p| p.record.is_some())
            .ok_or_else(|| PipelinerError::TagDetach(format!("no pipeline {}", pipeline_id)))?;
        if !entry.tags.remove(tag) {
            return Err(PipelinerError::TagDetach(format!("tag {} is not attached", tag)));
        }
        Ok(())
    }

    async fn get_pipeline_tags(&self, pipeline_id: Uuid) -> Result<Vec<String>> {
        let catalog = self.catalog();
        let entry = catalog
            .pipelines
            .get(&pipeline_id)
            .filter(|p| p.record.is_some())
            .ok_or_else(|| PipelinerError::GetTag(format!("no pipeline {}", pipeline_id)))?;
        Ok(entry.tags.iter().cloned().collect())
    }

    async fn pipelines_using_module(&self, module: &str) -> Result<Vec<Uuid>> {
        let catalog = self.catalog();
        let mut ids: Vec<Uuid> = catalog
            .pipelines
            .keys()
            .filter_map(|id| catalog.current_version(*id))
            .filter(|v| {
                v.content
                    .pipeline
                    .blocks
                    .values()
                    .any(|b| b.block_type == "python3" && b.title == module)
            })
            .map(|v| v.pipeline_id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlockDescriptor, PipelineBody};
    use serde_json::json;

    fn create_test_scenario(pipeline_id: Uuid, name: &str) -> Scenario {
        let mut blocks = BTreeMap::new();
        blocks.insert("Block1".to_string(), BlockDescriptor::new("python3", "echo"));
        Scenario {
            id: pipeline_id,
            version_id: Uuid::new_v4(),
            name: name.to_string(),
            status: VersionStatus::Draft,
            input: Vec::new(),
            output: Vec::new(),
            pipeline: PipelineBody {
                entrypoint: "Block1".to_string(),
                blocks,
            },
        }
    }

    async fn create_test_pipeline(storage: &InMemoryStorage, name: &str) -> (Uuid, Uuid) {
        let id = Uuid::new_v4();
        let draft = Version::new_draft(create_test_scenario(id, name), "author", None);
        let version_id = draft.version_id;
        let record = PipelineRecord {
            id,
            name: name.to_string(),
            author: "author".to_string(),
            created_at: Utc::now(),
        };
        storage.create_pipeline(record, draft).await.unwrap();
        (id, version_id)
    }

    async fn approve(storage: &InMemoryStorage, pipeline_id: Uuid, version_id: Uuid) {
        storage.send_to_approve(version_id).await.unwrap();
        storage.switch_approved(pipeline_id, version_id, "approver").await.unwrap();
    }

    fn create_test_step(task_id: Uuid, index: u64) -> NewStep {
        NewStep {
            task_id,
            index,
            block_name: format!("Block{}", index),
            block_type: "python3".to_string(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            state: BTreeMap::new(),
            snapshot: StoreSnapshot::default(),
            break_points: BTreeSet::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_pipeline_names_are_unique() {
        let storage = InMemoryStorage::new();
        create_test_pipeline(&storage, "Linear").await;

        let id = Uuid::new_v4();
        let draft = Version::new_draft(create_test_scenario(id, "Linear"), "author", None);
        let record = PipelineRecord {
            id,
            name: "Linear".to_string(),
            author: "author".to_string(),
            created_at: Utc::now(),
        };
        let err = storage.create_pipeline(record, draft).await.unwrap_err();
        assert!(matches!(err, PipelinerError::PipelineNameUsed(_)));
    }

    #[tokio::test]
    async fn test_only_one_draft_per_pipeline() {
        let storage = InMemoryStorage::new();
        let (id, _) = create_test_pipeline(&storage, "Linear").await;

        let second = Version::new_draft(create_test_scenario(id, "Linear"), "author", None);
        let err = storage.create_version(second).await.unwrap_err();
        assert!(matches!(err, PipelinerError::PipelineHasDraft(_)));
    }

    #[tokio::test]
    async fn test_approving_archives_previous_version() {
        let storage = InMemoryStorage::new();
        let (id, v1) = create_test_pipeline(&storage, "Linear").await;
        approve(&storage, id, v1).await;

        let draft = Version::new_draft(create_test_scenario(id, "Linear"), "author", Some(v1));
        let v2 = draft.version_id;
        storage.create_version(draft).await.unwrap();
        approve(&storage, id, v2).await;

        let approved = storage.get_versions_by_status(VersionStatus::Approved, None).await.unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].version_id, v2);
        assert_eq!(storage.get_pipeline(id).await.unwrap().unwrap().version_id, v2);

        storage.rollback_version(id, v1).await.unwrap();
        assert_eq!(storage.get_pipeline(id).await.unwrap().unwrap().version_id, v1);
        let v2_status = storage.get_pipeline_version(v2).await.unwrap().unwrap().status;
        assert_eq!(v2_status, VersionStatus::Deleted);
    }

    #[tokio::test]
    async fn test_rejection_keeps_serving_approved_version() {
        let storage = InMemoryStorage::new();
        let (id, v1) = create_test_pipeline(&storage, "Linear").await;
        approve(&storage, id, v1).await;

        let draft = Version::new_draft(create_test_scenario(id, "Linear"), "author", Some(v1));
        let v2 = draft.version_id;
        storage.create_version(draft).await.unwrap();
        storage.send_to_approve(v2).await.unwrap();
        storage.switch_rejected(v2, "needs work", "approver").await.unwrap();

        let rejected = storage.get_pipeline_version(v2).await.unwrap().unwrap();
        assert_eq!(rejected.status, VersionStatus::Rejected);
        assert_eq!(rejected.comment_rejected.as_deref(), Some("needs work"));
        assert_eq!(storage.get_pipeline(id).await.unwrap().unwrap().version_id, v1);
    }

    #[tokio::test]
    async fn test_rejected_version_reopens_as_the_only_draft() {
        let storage = InMemoryStorage::new();
        let (id, v1) = create_test_pipeline(&storage, "Linear").await;
        storage.send_to_approve(v1).await.unwrap();
        storage.switch_rejected(v1, "needs work", "approver").await.unwrap();

        storage.update_draft(v1, create_test_scenario(id, "Linear")).await.unwrap();
        assert_eq!(storage.get_pipeline_version(v1).await.unwrap().unwrap().status, VersionStatus::Draft);

        storage.send_to_approve(v1).await.unwrap();
        storage.switch_rejected(v1, "still wrong", "approver").await.unwrap();
        let other = Version::new_draft(create_test_scenario(id, "Linear"), "author", None);
        storage.create_version(other).await.unwrap();

        let err = storage.update_draft(v1, create_test_scenario(id, "Linear")).await.unwrap_err();
        assert!(matches!(err, PipelinerError::PipelineHasDraft(_)));
    }

    #[tokio::test]
    async fn test_approved_version_cannot_be_deleted() {
        let storage = InMemoryStorage::new();
        let (id, v1) = create_test_pipeline(&storage, "Linear").await;
        approve(&storage, id, v1).await;

        let err = storage.delete_version(v1).await.unwrap_err();
        assert!(matches!(err, PipelinerError::PipelineDelete(_)));

        storage.delete_pipeline(id).await.unwrap();
        assert!(storage.get_pipeline(id).await.unwrap().is_none());
        assert!(storage.get_executable_by_name("Linear").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_executable_by_name_and_module_usage() {
        let storage = InMemoryStorage::new();
        let (id, v1) = create_test_pipeline(&storage, "Sub").await;
        create_test_pipeline(&storage, "Unapproved").await;
        approve(&storage, id, v1).await;

        let sub = storage.get_executable_by_name("Sub").await.unwrap().unwrap();
        assert_eq!(sub.status, VersionStatus::Approved);
        assert_eq!(storage.get_executable_scenarios().await.unwrap().len(), 1);
        assert_eq!(storage.pipelines_using_module("echo").await.unwrap(), vec![id]);
        assert!(storage.pipelines_using_module("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_step_indexes_must_be_dense() {
        let storage = InMemoryStorage::new();
        let task = storage
            .create_task(Task::new(Uuid::new_v4(), "author", false, json!({})))
            .await
            .unwrap();

        let first = storage.append_step(create_test_step(task.id, 0)).await.unwrap();
        let err = storage.append_step(create_test_step(task.id, 2)).await.unwrap_err();
        assert!(matches!(err, PipelinerError::Storage(_)));

        storage
            .finish_step(
                first,
                StepUpdate {
                    finished_at: Utc::now(),
                    status: StepStatus::Finished,
                    state: BTreeMap::new(),
                    snapshot: StoreSnapshot::default(),
                    error: None,
                },
            )
            .await
            .unwrap();

        let steps = storage.get_task_steps(task.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Finished);
        assert!(steps[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_tags_attach_and_detach() {
        let storage = InMemoryStorage::new();
        let (id, _) = create_test_pipeline(&storage, "Linear").await;

        storage.attach_tag(id, "billing").await.unwrap();
        storage.attach_tag(id, "alarms").await.unwrap();
        assert_eq!(storage.get_pipeline_tags(id).await.unwrap(), vec!["alarms", "billing"]);

        storage.detach_tag(id, "billing").await.unwrap();
        assert!(matches!(
            storage.detach_tag(id, "billing").await,
            Err(PipelinerError::TagDetach(_))
        ));
    }
}
