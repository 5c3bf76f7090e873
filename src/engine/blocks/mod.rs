// Block kinds - one file per kind of scenario block

//! # Block Kinds
//!
//! Control blocks (`input`, `if`, `strings_is_equal`, `for`, `connector`,
//! `vars`) only touch the [`VariableStore`]. Integration leaves (`python3`,
//! NGSA, Remedy) perform HTTP through the shared client and record one
//! ok/fail metric per run. The `scenario` block runs a nested pipeline.
//!
//! The loader maps a descriptor to a kind by `block_type` and, for the
//! internal family, by `title`.

pub mod connector;
pub mod equal;
pub mod for_state;
pub mod function;
pub mod if_state;
pub mod input;
pub mod ngsa;
pub mod remedy;
pub mod scenario;
pub mod vars;

pub use connector::ConnectorBlock;
pub use equal::StringsEqualBlock;
pub use for_state::ForStateBlock;
pub use function::FunctionBlock;
pub use if_state::IfStateBlock;
pub use input::InputBlock;
pub use ngsa::NgsaSendBlock;
pub use remedy::{RemedyBlock, RemedyKind};
pub use scenario::ScenarioBlock;
pub use vars::VarsBlock;

use chrono::DateTime;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use super::block::{BlockModel, FunctionValueModel};
use super::store::VariableStore;
use crate::models::{BlockDescriptor, NEXT_SLOT};
use crate::{PipelinerError, Result};

// Block families
pub const TYPE_PYTHON3: &str = "python3";
pub const TYPE_INTERNAL: &str = "internal";
pub const TYPE_TERM: &str = "term";
pub const TYPE_GO: &str = "go";
pub const TYPE_SCENARIO: &str = "scenario";

// Shape hints
pub const SHAPE_FUNCTION: &str = "function";
pub const SHAPE_CONDITION: &str = "condition";
pub const SHAPE_CYCLE: &str = "cycle";
pub const SHAPE_CONNECTOR: &str = "connector";
pub const SHAPE_INTEGRATION: &str = "integration";
pub const SHAPE_SCENARIO: &str = "scenario";

/// Identity and alias maps every block carries
#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub name: String,
    pub block_type: String,
    pub title: String,
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
}

impl BlockHeader {
    pub fn from_descriptor(name: &str, descriptor: &BlockDescriptor) -> Self {
        Self {
            name: name.to_string(),
            block_type: descriptor.block_type.clone(),
            title: descriptor.title.clone(),
            inputs: descriptor.input_map(),
            outputs: descriptor.output_map(),
        }
    }
}

/// An edge target, or `None` when the edge is unset or empty
pub(crate) fn edge(target: &Option<String>) -> Option<String> {
    target.as_ref().filter(|t| !t.is_empty()).cloned()
}

pub(crate) fn values_model(fields: &[(&str, &str)]) -> Vec<FunctionValueModel> {
    fields
        .iter()
        .map(|(name, value_type)| FunctionValueModel::new(name, value_type))
        .collect()
}

pub(crate) fn model(
    block_type: &str,
    title: &str,
    inputs: Vec<FunctionValueModel>,
    outputs: Vec<FunctionValueModel>,
    next: &[&str],
    shape: &str,
) -> BlockModel {
    BlockModel {
        block_type: block_type.to_string(),
        title: title.to_string(),
        inputs,
        outputs,
        next: next.iter().map(|n| n.to_string()).collect(),
        shape: shape.to_string(),
    }
}

pub(crate) fn default_next() -> &'static [&'static str] {
    &[NEXT_SLOT]
}

/// Declared kind of an integration payload field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    /// RFC 3339 timestamp carried as a string
    Time,
}

impl FieldKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Time => "time",
        }
    }

    /// Check a store value against the kind, normalising numeric strings
    fn coerce(&self, key: &str, value: Value) -> Result<Value> {
        let wrong = || PipelinerError::WrongType {
            key: key.to_string(),
            expected: self.type_name(),
        };

        match (self, value) {
            (FieldKind::String, v @ Value::String(_)) => Ok(v),
            (FieldKind::Number, v @ Value::Number(_)) => Ok(v),
            (FieldKind::Number, Value::String(s)) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    return Ok(Value::Number(i.into()));
                }
                trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(wrong)
            }
            (FieldKind::Time, Value::String(s)) => {
                DateTime::parse_from_rfc3339(&s).map_err(|_| wrong())?;
                Ok(Value::String(s))
            }
            _ => Err(wrong()),
        }
    }
}

/// Marshal declared inputs found in the store into a payload keyed by field name
///
/// Fields without an input alias or without a stored value are left out.
pub fn collect_fields(
    store: &VariableStore,
    inputs: &BTreeMap<String, String>,
    table: &[(&str, FieldKind)],
) -> Result<Map<String, Value>> {
    let mut payload = Map::new();
    for (field, kind) in table {
        let Some(alias) = inputs.get(*field) else {
            continue;
        };
        let Some(value) = store.get(alias) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        payload.insert(field.to_string(), kind.coerce(alias, value)?);
    }
    Ok(payload)
}

pub(crate) fn fields_model(table: &[(&str, FieldKind)]) -> Vec<FunctionValueModel> {
    table
        .iter()
        .map(|(name, kind)| FunctionValueModel::new(name, kind.type_name()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TABLE: &[(&str, FieldKind)] = &[
        ("theme", FieldKind::String),
        ("urgency", FieldKind::Number),
        ("regtime", FieldKind::Time),
        ("unset", FieldKind::String),
    ];

    fn create_test_inputs() -> BTreeMap<String, String> {
        ["theme", "urgency", "regtime", "unset"]
            .iter()
            .map(|k| (k.to_string(), format!("S.{}", k)))
            .collect()
    }

    #[test]
    fn test_collect_fields_coerces_and_skips_missing() {
        let store = VariableStore::new();
        store.set("S.theme", json!("outage"));
        store.set("S.urgency", json!("3"));
        store.set("S.regtime", json!("2022-07-18T10:00:00Z"));

        let payload = collect_fields(&store, &create_test_inputs(), TABLE).unwrap();
        assert_eq!(payload["theme"], "outage");
        assert_eq!(payload["urgency"], 3);
        assert_eq!(payload["regtime"], "2022-07-18T10:00:00Z");
        assert!(!payload.contains_key("unset"));
    }

    #[test]
    fn test_collect_fields_rejects_wrong_kinds() {
        let store = VariableStore::new();
        store.set("S.regtime", json!("yesterday"));
        assert!(matches!(
            collect_fields(&store, &create_test_inputs(), TABLE),
            Err(PipelinerError::WrongType { expected: "time", .. })
        ));

        let store = VariableStore::new();
        store.set("S.theme", json!(42));
        assert!(matches!(
            collect_fields(&store, &create_test_inputs(), TABLE),
            Err(PipelinerError::WrongType { expected: "string", .. })
        ));
    }

    #[test]
    fn test_edge_treats_empty_as_terminal() {
        assert_eq!(edge(&Some(String::new())), None);
        assert_eq!(edge(&Some("Block2".to_string())), Some("Block2".to_string()));
        assert_eq!(edge(&None), None);
    }
}
