//! Early-termination predicates for retried actions.

use crate::db::Row;
use crate::validator::{as_number, get_value_by_path, text_of};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const CONTENT_EPSILON: f64 = 0.0001;

/// Conjunction of optional checks. Every field that is present must
/// hold for the condition to be satisfied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopCondition {
    #[serde(default)]
    pub larger_than_size: Option<f64>,
    #[serde(default)]
    pub less_than_size: Option<f64>,
    #[serde(default)]
    pub content_equals: Option<Value>,
    #[serde(default)]
    pub content_contains: Option<Value>,
    /// Path to expected value. `%x%` expectations match by
    /// case-insensitive substring.
    #[serde(default)]
    pub json_contains: Option<Map<String, Value>>,
    #[serde(default)]
    pub json_not_contains: Option<Map<String, Value>>,
    /// A single key or a list of keys that must all be present.
    #[serde(default)]
    pub json_contains_key: Option<Value>,
}

impl StopCondition {
    /// Evaluate against a database result set. An empty result never
    /// satisfies the condition.
    pub fn evaluate_rows(&self, rows: &[Row]) -> bool {
        if rows.is_empty() {
            return false;
        }
        let cells = || rows.iter().flat_map(|row| row.values());

        if let Some(min) = self.larger_than_size {
            if (rows.len() as f64) <= min {
                return false;
            }
        }
        if let Some(max) = self.less_than_size {
            if (rows.len() as f64) >= max {
                return false;
            }
        }
        if let Some(expected) = &self.content_equals {
            if !cells().any(|cell| cell_equals(cell, expected)) {
                return false;
            }
        }
        if let Some(expected) = &self.content_contains {
            let needle = text_of(expected).to_lowercase();
            if !cells().any(|cell| text_of(cell).to_lowercase().contains(&needle)) {
                return false;
            }
        }
        if let Some(pairs) = &self.json_contains {
            if !rows.iter().any(|row| object_matches(row, pairs)) {
                return false;
            }
        }
        if let Some(pairs) = &self.json_not_contains {
            if rows.iter().any(|row| object_matches_any(row, pairs)) {
                return false;
            }
        }
        if let Some(keys) = &self.json_contains_key {
            let keys = key_list(keys);
            let has_keys = |row: &Row| {
                let root = Value::Object(row.clone());
                keys.iter().all(|k| get_value_by_path(&root, k).is_some())
            };
            if !rows.iter().any(has_keys) {
                return false;
            }
        }
        true
    }

    /// Evaluate against an HTTP response body.
    pub fn evaluate_body(&self, body: &str) -> bool {
        if let Some(expected) = &self.content_equals {
            if body != text_of(expected) {
                return false;
            }
        }
        if let Some(expected) = &self.content_contains {
            if !body
                .to_lowercase()
                .contains(&text_of(expected).to_lowercase())
            {
                return false;
            }
        }
        if self.larger_than_size.is_some() || self.less_than_size.is_some() {
            let Ok(size) = body.trim().parse::<f64>() else {
                return false;
            };
            if self.larger_than_size.is_some_and(|min| size <= min)
                || self.less_than_size.is_some_and(|max| size >= max)
            {
                return false;
            }
        }

        let needs_json = self.json_contains.is_some()
            || self.json_not_contains.is_some()
            || self.json_contains_key.is_some();
        if !needs_json {
            return true;
        }
        let Ok(Value::Object(object)) = serde_json::from_str::<Value>(body) else {
            return false;
        };
        if let Some(pairs) = &self.json_contains {
            if !object_matches(&object, pairs) {
                return false;
            }
        }
        if let Some(pairs) = &self.json_not_contains {
            if object_matches_any(&object, pairs) {
                return false;
            }
        }
        if let Some(keys) = &self.json_contains_key {
            let root = Value::Object(object);
            if !key_list(keys)
                .iter()
                .all(|k| get_value_by_path(&root, k).is_some())
            {
                return false;
            }
        }
        true
    }
}

fn cell_equals(cell: &Value, expected: &Value) -> bool {
    match (as_number(cell), as_number(expected)) {
        (Some(a), Some(b)) => (a - b).abs() < CONTENT_EPSILON,
        _ => text_of(cell).eq_ignore_ascii_case(&text_of(expected)),
    }
}

fn expectation_matches(actual: Option<&Value>, expected: &Value) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    let expected = text_of(expected);
    let actual = text_of(actual);
    match expected
        .strip_prefix('%')
        .and_then(|rest| rest.strip_suffix('%'))
    {
        Some(pattern) => actual.to_lowercase().contains(&pattern.to_lowercase()),
        None => actual == expected,
    }
}

fn object_matches(object: &Map<String, Value>, pairs: &Map<String, Value>) -> bool {
    let root = Value::Object(object.clone());
    pairs
        .iter()
        .all(|(path, expected)| expectation_matches(get_value_by_path(&root, path), expected))
}

fn object_matches_any(object: &Map<String, Value>, pairs: &Map<String, Value>) -> bool {
    let root = Value::Object(object.clone());
    pairs
        .iter()
        .any(|(path, expected)| expectation_matches(get_value_by_path(&root, path), expected))
}

fn key_list(keys: &Value) -> Vec<String> {
    match keys {
        Value::Array(items) => items.iter().map(text_of).collect(),
        other => vec![text_of(other)],
    }
}
