// Variable store - the task-local dataflow medium between blocks

//! # Variable Store
//!
//! Blocks never talk to each other directly. Each block declares, per local
//! input/output name, a fully qualified key (`scope.key`) in a flat map; the
//! engine hands every block the same `VariableStore` and the block reads and
//! writes through those aliases.
//!
//! Besides the values the store keeps two append-only logs (block names run
//! so far, error messages) and the debug stop points of the session.
//!
//! ## Thread Safety
//!
//! All operations take the internal `Mutex`. Blocks run sequentially, so the
//! lock mostly guards snapshots taken while a step record is persisted.
//! Poisoning is recovered: the data inside stays consistent because every
//! critical section is a single map or vector operation.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::Step;
use crate::{PipelinerError, Result};

pub use crate::models::StoreSnapshot;

/// Debug stop points of a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopPoints {
    /// Blocks to pause at before they run
    pub break_points: BTreeSet<String>,
    /// Blocks already stepped over in this session
    pub step_over_points: BTreeSet<String>,
    /// Blocks that must not pause even when listed as break points
    pub excluded_points: BTreeSet<String>,
    /// Block the session started (or resumed) at
    pub start_point: String,
}

impl StopPoints {
    pub fn new(start_point: impl Into<String>) -> Self {
        Self {
            start_point: start_point.into(),
            ..Default::default()
        }
    }

    pub fn set_break_points<I, S>(&mut self, points: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.break_points = points.into_iter().map(Into::into).collect();
    }

    pub fn exclude(&mut self, name: impl Into<String>) {
        self.excluded_points.insert(name.into());
    }

    pub fn is_break_point(&self, name: &str) -> bool {
        self.break_points.contains(name) && !self.excluded_points.contains(name)
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    values: BTreeMap<String, Value>,
    steps: Vec<String>,
    errors: Vec<String>,
    stop_points: StopPoints,
}

/// Thread-safe mapping of qualified names to values plus step and error logs
#[derive(Debug, Default)]
pub struct VariableStore {
    inner: Mutex<StoreInner>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build a store from a snapshot with the supplied stop points attached
    pub fn from_snapshot(snapshot: StoreSnapshot, stop_points: StopPoints) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                values: snapshot.values,
                steps: snapshot.steps,
                errors: snapshot.errors,
                stop_points,
            }),
        }
    }

    /// Rebuild the store a step recorded, attaching the given break points
    ///
    /// The step's block becomes the session start point.
    pub fn restore_from(step: &Step, break_points: &BTreeSet<String>) -> Self {
        let mut stop_points = StopPoints::new(step.block_name.clone());
        stop_points.set_break_points(break_points.iter().cloned());
        Self::from_snapshot(step.snapshot.clone(), stop_points)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.lock().values.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().values.contains_key(name)
    }

    /// Last writer wins; an empty name is ignored
    pub fn set(&self, name: &str, value: Value) {
        if name.is_empty() {
            return;
        }
        self.lock().values.insert(name.to_string(), value);
    }

    pub fn get_string(&self, name: &str) -> Result<String> {
        match self.get(name) {
            None => Err(PipelinerError::UnknownKey(name.to_string())),
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(PipelinerError::WrongType {
                key: name.to_string(),
                expected: "string",
            }),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool> {
        match self.get(name) {
            None => Err(PipelinerError::UnknownKey(name.to_string())),
            Some(Value::Bool(b)) => Ok(b),
            Some(_) => Err(PipelinerError::WrongType {
                key: name.to_string(),
                expected: "bool",
            }),
        }
    }

    pub fn get_array(&self, name: &str) -> Result<Vec<Value>> {
        match self.get(name) {
            None => Err(PipelinerError::UnknownKey(name.to_string())),
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(PipelinerError::WrongType {
                key: name.to_string(),
                expected: "array",
            }),
        }
    }

    /// Resolve `inputs[key]` to its qualified name, then read it
    pub fn get_with_input(&self, inputs: &BTreeMap<String, String>, key: &str) -> Result<Value> {
        let alias = alias_of(inputs, key)?;
        self.get(alias)
            .ok_or_else(|| PipelinerError::UnknownKey(alias.to_string()))
    }

    pub fn get_string_with_input(&self, inputs: &BTreeMap<String, String>, key: &str) -> Result<String> {
        self.get_string(alias_of(inputs, key)?)
    }

    pub fn get_bool_with_input(&self, inputs: &BTreeMap<String, String>, key: &str) -> Result<bool> {
        self.get_bool(alias_of(inputs, key)?)
    }

    /// Write through `outputs[key]`; unmapped outputs are dropped
    pub fn set_with_output(&self, outputs: &BTreeMap<String, String>, key: &str, value: Value) {
        if let Some(alias) = outputs.get(key) {
            self.set(alias, value);
        }
    }

    /// Append to the step log unless the same block was the last entry
    pub fn add_step(&self, name: &str) {
        let mut inner = self.lock();
        if inner.steps.last().map(String::as_str) == Some(name) {
            return;
        }
        inner.steps.push(name.to_string());
    }

    pub fn add_error(&self, err: impl ToString) {
        self.lock().errors.push(err.to_string());
    }

    pub fn steps(&self) -> Vec<String> {
        self.lock().steps.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.lock().errors.clone()
    }

    pub fn values(&self) -> BTreeMap<String, Value> {
        self.lock().values.clone()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.lock();
        StoreSnapshot {
            values: inner.values.clone(),
            steps: inner.steps.clone(),
            errors: inner.errors.clone(),
        }
    }

    pub fn stop_points(&self) -> StopPoints {
        self.lock().stop_points.clone()
    }

    pub fn set_stop_points(&self, stop_points: StopPoints) {
        self.lock().stop_points = stop_points;
    }

    pub fn break_points(&self) -> BTreeSet<String> {
        self.lock().stop_points.break_points.clone()
    }

    pub fn is_break_point(&self, name: &str) -> bool {
        self.lock().stop_points.is_break_point(name)
    }

    pub fn mark_stepped_over(&self, name: &str) {
        self.lock()
            .stop_points
            .step_over_points
            .insert(name.to_string());
    }
}

fn alias_of<'a>(map: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    map.get(key)
        .map(String::as_str)
        .ok_or_else(|| PipelinerError::InvalidInput(format!("no such key: {}", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepStatus;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn create_test_inputs() -> BTreeMap<String, String> {
        let mut inputs = BTreeMap::new();
        inputs.insert("check".to_string(), "Block1.Output".to_string());
        inputs
    }

    #[test]
    fn test_set_and_get_typed_values() {
        let store = VariableStore::new();
        store.set("S.name", json!("Value"));
        store.set("S.flag", json!(true));
        store.set("S.list", json!([1, 2, 3]));

        assert_eq!(store.get_string("S.name").unwrap(), "Value");
        assert!(store.get_bool("S.flag").unwrap());
        assert_eq!(store.get_array("S.list").unwrap().len(), 3);
    }

    #[test]
    fn test_typed_getters_report_unknown_and_wrong_type() {
        let store = VariableStore::new();
        store.set("S.name", json!(1));

        assert!(matches!(store.get_string("S.missing"), Err(PipelinerError::UnknownKey(_))));
        assert!(matches!(
            store.get_string("S.name"),
            Err(PipelinerError::WrongType { expected: "string", .. })
        ));
        assert!(matches!(store.get_bool("S.name"), Err(PipelinerError::WrongType { .. })));
        assert!(matches!(store.get_array("S.name"), Err(PipelinerError::WrongType { .. })));
    }

    #[test]
    fn test_empty_name_is_ignored() {
        let store = VariableStore::new();
        store.set("", json!("lost"));
        assert!(store.values().is_empty());
    }

    #[test]
    fn test_alias_helpers_resolve_through_maps() {
        let store = VariableStore::new();
        store.set("Block1.Output", json!(true));

        let inputs = create_test_inputs();
        assert!(store.get_bool_with_input(&inputs, "check").unwrap());
        assert!(matches!(
            store.get_bool_with_input(&inputs, "other"),
            Err(PipelinerError::InvalidInput(_))
        ));

        let mut outputs = BTreeMap::new();
        outputs.insert("Output".to_string(), "Block2.Output".to_string());
        store.set_with_output(&outputs, "Output", json!("x"));
        store.set_with_output(&outputs, "Unmapped", json!("y"));
        assert_eq!(store.get("Block2.Output"), Some(json!("x")));
        assert_eq!(store.values().len(), 2);
    }

    #[test]
    fn test_add_step_collapses_repeats() {
        let store = VariableStore::new();
        store.add_step("For");
        store.add_step("For");
        store.add_step("Body");
        store.add_step("For");
        assert_eq!(store.steps(), vec!["For", "Body", "For"]);
    }

    #[test]
    fn test_snapshot_restore_is_identity() {
        let store = VariableStore::new();
        store.set("S.a", json!({"nested": [1, 2]}));
        store.add_step("Block1");
        store.add_error("boom");
        let snapshot = store.snapshot();

        let step = Step {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            index: 0,
            block_name: "Block1".to_string(),
            block_type: "python3".to_string(),
            status: StepStatus::Finished,
            started_at: Utc::now(),
            finished_at: None,
            state: BTreeMap::new(),
            snapshot: snapshot.clone(),
            break_points: BTreeSet::new(),
            error: None,
        };

        let mut points = BTreeSet::new();
        points.insert("Block2".to_string());
        let restored = VariableStore::restore_from(&step, &points);

        assert_eq!(restored.snapshot(), snapshot);
        assert!(restored.is_break_point("Block2"));
        assert_eq!(restored.stop_points().start_point, "Block1");
    }

    #[test]
    fn test_excluded_points_never_break() {
        let mut points = StopPoints::new("Block1");
        points.set_break_points(["Block1", "Block2"]);
        points.exclude("Block1");
        assert!(!points.is_break_point("Block1"));
        assert!(points.is_break_point("Block2"));
    }
}
