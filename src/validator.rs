//! Condition evaluation shared by assertions and retry stop-conditions.
//!
//! [`validate`] compares an actual value (`key`) against an expected
//! value (`value`) under a [`Condition`]. Scalar equality understands
//! `%` wildcards and the `${ignore}` sentinel; structured values are
//! compared recursively and mismatches are reported with the path at
//! which they were found.

use crate::error::StepError;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Expected value that matches anything.
pub const IGNORE_SENTINEL: &str = "${ignore}";

const APPROXIMATE_EPSILON: f64 = 0.0001;

/// Assertion condition names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Condition {
    IsEqual,
    IsNotEqual,
    IsIn,
    IsNotIn,
    IsTrue,
    IsFalse,
    IsApproximate4,
    IsNotApproximate4,
    IsStartWith,
    IsEndWith,
    IsLengthEqual,
    IsLengthNotEqual,
    IsLengthLargerThan,
    IsLengthLessThan,
    IsJsonContain,
    IsJsonNotContain,
    IsContain,
    IsNotContain,
    IsLargerThan,
    IsLessThan,
    IsLargerThanOrEqual,
    IsLessThanOrEqual,
    IsNull,
    IsNotNull,
    IsRegexMatch,
    IsRegexNotMatch,
    IsJsonEqual,
    IsJsonNotEqual,
    IsOpposite,
    IsDateEqual,
    IsDateNotEqual,
    IsDateLargerThanOrEqual,
    IsDateLargerThan,
    IsDateLessThanOrEqual,
    IsDateLessThan,
}

impl Condition {
    pub const ALL: [Condition; 35] = [
        Condition::IsEqual,
        Condition::IsNotEqual,
        Condition::IsIn,
        Condition::IsNotIn,
        Condition::IsTrue,
        Condition::IsFalse,
        Condition::IsApproximate4,
        Condition::IsNotApproximate4,
        Condition::IsStartWith,
        Condition::IsEndWith,
        Condition::IsLengthEqual,
        Condition::IsLengthNotEqual,
        Condition::IsLengthLargerThan,
        Condition::IsLengthLessThan,
        Condition::IsJsonContain,
        Condition::IsJsonNotContain,
        Condition::IsContain,
        Condition::IsNotContain,
        Condition::IsLargerThan,
        Condition::IsLessThan,
        Condition::IsLargerThanOrEqual,
        Condition::IsLessThanOrEqual,
        Condition::IsNull,
        Condition::IsNotNull,
        Condition::IsRegexMatch,
        Condition::IsRegexNotMatch,
        Condition::IsJsonEqual,
        Condition::IsJsonNotEqual,
        Condition::IsOpposite,
        Condition::IsDateEqual,
        Condition::IsDateNotEqual,
        Condition::IsDateLargerThanOrEqual,
        Condition::IsDateLargerThan,
        Condition::IsDateLessThanOrEqual,
        Condition::IsDateLessThan,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Condition::IsEqual => "IsEqual",
            Condition::IsNotEqual => "IsNotEqual",
            Condition::IsIn => "IsIn",
            Condition::IsNotIn => "IsNotIn",
            Condition::IsTrue => "IsTrue",
            Condition::IsFalse => "IsFalse",
            Condition::IsApproximate4 => "IsApproximate4",
            Condition::IsNotApproximate4 => "IsNotApproximate4",
            Condition::IsStartWith => "IsStartWith",
            Condition::IsEndWith => "IsEndWith",
            Condition::IsLengthEqual => "IsLengthEqual",
            Condition::IsLengthNotEqual => "IsLengthNotEqual",
            Condition::IsLengthLargerThan => "IsLengthLargerThan",
            Condition::IsLengthLessThan => "IsLengthLessThan",
            Condition::IsJsonContain => "IsJsonContain",
            Condition::IsJsonNotContain => "IsJsonNotContain",
            Condition::IsContain => "IsContain",
            Condition::IsNotContain => "IsNotContain",
            Condition::IsLargerThan => "IsLargerThan",
            Condition::IsLessThan => "IsLessThan",
            Condition::IsLargerThanOrEqual => "IsLargerThanOrEqual",
            Condition::IsLessThanOrEqual => "IsLessThanOrEqual",
            Condition::IsNull => "IsNull",
            Condition::IsNotNull => "IsNotNull",
            Condition::IsRegexMatch => "IsRegexMatch",
            Condition::IsRegexNotMatch => "IsRegexNotMatch",
            Condition::IsJsonEqual => "IsJsonEqual",
            Condition::IsJsonNotEqual => "IsJsonNotEqual",
            Condition::IsOpposite => "IsOpposite",
            Condition::IsDateEqual => "IsDateEqual",
            Condition::IsDateNotEqual => "IsDateNotEqual",
            Condition::IsDateLargerThanOrEqual => "IsDateLargerThanOrEqual",
            Condition::IsDateLargerThan => "IsDateLargerThan",
            Condition::IsDateLessThanOrEqual => "IsDateLessThanOrEqual",
            Condition::IsDateLessThan => "IsDateLessThan",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Condition {
    type Err = StepError;

    /// Case-insensitive lookup by condition name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Condition::ALL
            .iter()
            .find(|c| c.name().eq_ignore_ascii_case(wanted))
            .copied()
            .ok_or_else(|| {
                StepError::Configuration(format!(
                    "Unknown assertion condition '{s}'"
                ))
            })
    }
}

impl TryFrom<String> for Condition {
    type Error = StepError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Condition> for String {
    fn from(condition: Condition) -> Self {
        condition.name().to_string()
    }
}

/// Outcome of a single validation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Verdict {
    pub passed: bool,
    /// Diagnostic detail, empty when nothing useful can be said.
    pub reason: String,
}

impl Verdict {
    fn pass() -> Self {
        Self {
            passed: true,
            reason: String::new(),
        }
    }

    fn from_bool(passed: bool, reason: impl FnOnce() -> String) -> Self {
        if passed {
            Self::pass()
        } else {
            Self {
                passed: false,
                reason: reason(),
            }
        }
    }
}

/// Validate `key` (actual) against `value` (expected).
pub fn validate(key: &Value, value: &Value, condition: Condition) -> Verdict {
    let (key, value, condition) = normalize(key, value, condition);
    evaluate(key, value, condition)
}

/// Same as [`validate`] but with the condition given by name.
pub fn validate_named(
    key: &Value,
    value: &Value,
    condition: &str,
) -> Result<Verdict, StepError> {
    Ok(validate(key, value, condition.parse()?))
}

/// Rewrite the generic equality and membership conditions to their
/// structural forms when an operand is a container.
fn normalize<'a>(
    key: &'a Value,
    value: &'a Value,
    condition: Condition,
) -> (&'a Value, &'a Value, Condition) {
    let structured = is_container(key) || is_container(value);
    match condition {
        Condition::IsEqual if structured => (key, value, Condition::IsJsonEqual),
        Condition::IsNotEqual if structured => {
            (key, value, Condition::IsJsonNotEqual)
        }
        Condition::IsIn if value.is_array() => {
            (value, key, Condition::IsJsonContain)
        }
        Condition::IsNotIn if value.is_array() => {
            (value, key, Condition::IsJsonNotContain)
        }
        other => (key, value, other),
    }
}

fn evaluate(key: &Value, value: &Value, condition: Condition) -> Verdict {
    use Condition::*;

    match condition {
        IsEqual | IsNotEqual => {
            let want = condition == IsEqual;
            Verdict::from_bool(primitive_equal(key, value) == want, || {
                mismatch(key, value, condition)
            })
        }
        IsIn | IsNotIn => {
            let want = condition == IsIn;
            let found = match value {
                Value::Object(map) => map.contains_key(&text_of(key)),
                other => text_of(other).contains(&text_of(key)),
            };
            Verdict::from_bool(found == want, || {
                mismatch(key, value, condition)
            })
        }
        IsTrue | IsFalse => {
            let want = condition == IsTrue;
            Verdict::from_bool(key.as_bool() == Some(want), || {
                format!("expected {want} but got {key}")
            })
        }
        IsApproximate4 | IsNotApproximate4 => {
            match (as_number(key), as_number(value)) {
                (Some(a), Some(b)) => {
                    let close = (a - b).abs() < APPROXIMATE_EPSILON;
                    Verdict::from_bool(close == (condition == IsApproximate4), || {
                        mismatch(key, value, condition)
                    })
                }
                _ => not_numeric(key, value),
            }
        }
        IsStartWith | IsEndWith => {
            let (k, v) = (text_of(key), text_of(value));
            let ok = if condition == IsStartWith {
                k.starts_with(&v)
            } else {
                k.ends_with(&v)
            };
            Verdict::from_bool(ok, || mismatch(key, value, condition))
        }
        IsLengthEqual | IsLengthNotEqual | IsLengthLargerThan
        | IsLengthLessThan => {
            let Some(len) = length_of(key) else {
                return Verdict::from_bool(false, || {
                    format!("{key} has no length")
                });
            };
            let Some(expected) = as_number(value) else {
                return not_numeric(key, value);
            };
            let len = len as f64;
            let ok = match condition {
                IsLengthEqual => len == expected,
                IsLengthNotEqual => len != expected,
                IsLengthLargerThan => len > expected,
                _ => len < expected,
            };
            Verdict::from_bool(ok, || {
                format!("length {len} does not satisfy {condition} {value}")
            })
        }
        IsContain | IsNotContain | IsJsonContain | IsJsonNotContain => {
            let want = matches!(condition, IsContain | IsJsonContain);
            match contains(key, value) {
                Some(found) => Verdict::from_bool(found == want, || {
                    mismatch(key, value, condition)
                }),
                None => Verdict::from_bool(false, || {
                    format!("cannot check containment of {value} in {key}")
                }),
            }
        }
        IsLargerThan | IsLessThan | IsLargerThanOrEqual
        | IsLessThanOrEqual => match (as_number(key), as_number(value)) {
            (Some(a), Some(b)) => {
                let ok = match condition {
                    IsLargerThan => a > b,
                    IsLessThan => a < b,
                    IsLargerThanOrEqual => a >= b,
                    _ => a <= b,
                };
                Verdict::from_bool(ok, || mismatch(key, value, condition))
            }
            _ => not_numeric(key, value),
        },
        IsNull | IsNotNull => {
            Verdict::from_bool(key.is_null() == (condition == IsNull), || {
                format!("{key} does not satisfy {condition}")
            })
        }
        IsRegexMatch | IsRegexNotMatch => match (key, value) {
            (Value::String(text), Value::String(pattern)) => {
                match Regex::new(&format!("^(?:{pattern})$")) {
                    Ok(re) => {
                        let want = condition == IsRegexMatch;
                        Verdict::from_bool(re.is_match(text) == want, || {
                            mismatch(key, value, condition)
                        })
                    }
                    Err(err) => Verdict::from_bool(false, || {
                        format!("invalid regex '{pattern}': {err}")
                    }),
                }
            }
            _ => Verdict::from_bool(false, || {
                "Key and Value should be strings for regex matching"
                    .to_string()
            }),
        },
        IsJsonEqual | IsJsonNotEqual => {
            let mut differences = Vec::new();
            let equal = compare(key, value, "", &mut differences);
            let want = condition == IsJsonEqual;
            Verdict::from_bool(equal == want, || {
                if differences.is_empty() {
                    mismatch(key, value, condition)
                } else {
                    differences.join(", ")
                }
            })
        }
        IsOpposite => {
            let ok = match (key, value) {
                (Value::Bool(a), Value::Bool(b)) => a != b,
                _ => match (as_number(key), as_number(value)) {
                    (Some(a), Some(b)) => a == -b,
                    _ => false,
                },
            };
            Verdict::from_bool(ok, || mismatch(key, value, condition))
        }
        IsDateEqual | IsDateNotEqual | IsDateLargerThanOrEqual
        | IsDateLargerThan | IsDateLessThanOrEqual | IsDateLessThan => {
            let (Some(a), Some(b)) = (parse_date(key), parse_date(value))
            else {
                return Verdict::from_bool(false, || {
                    format!("{key} or {value} is not a recognised date")
                });
            };
            let ok = match condition {
                IsDateEqual => a == b,
                IsDateNotEqual => a != b,
                IsDateLargerThanOrEqual => a >= b,
                IsDateLargerThan => a > b,
                IsDateLessThanOrEqual => a <= b,
                _ => a < b,
            };
            Verdict::from_bool(ok, || mismatch(key, value, condition))
        }
    }
}

fn mismatch(key: &Value, value: &Value, condition: Condition) -> String {
    format!("{key} does not satisfy {condition} {value}")
}

fn not_numeric(key: &Value, value: &Value) -> Verdict {
    Verdict::from_bool(false, || {
        format!("Key and Value should be numeric, got {key} and {value}")
    })
}

fn is_container(value: &Value) -> bool {
    value.is_object() || value.is_array()
}

fn is_ignore(value: &Value) -> bool {
    value.as_str() == Some(IGNORE_SENTINEL)
}

/// Walk a dotted path. Numeric segments index arrays.
pub fn get_value_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        match current {
            Value::Object(map) => current = map.get(part)?,
            Value::Array(items) => {
                let index = part.parse::<usize>().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Text used when a value is compared as a string: strings are taken
/// verbatim, everything else is rendered as JSON.
pub fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric view of a value; numeric-looking strings are coerced.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

/// Scalar equality with `%` wildcards on the expected side.
pub fn primitive_equal(left: &Value, right: &Value) -> bool {
    if is_ignore(left) || is_ignore(right) {
        return true;
    }
    match (left, right) {
        (Value::String(l), Value::String(r)) => wildcard_equal(l, r),
        (Value::Bool(l), Value::Bool(r)) => l == r,
        (Value::Null, Value::Null) => true,
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        _ => text_of(left) == text_of(right),
    }
}

/// `%x%` contains, `%x` ends with, `x%` starts with (all
/// case-insensitive); anything else must match exactly.
pub fn wildcard_equal(actual: &str, expected: &str) -> bool {
    let lower = actual.to_lowercase();
    if expected.len() >= 2 && expected.starts_with('%') && expected.ends_with('%')
    {
        let pattern = &expected[1..expected.len() - 1];
        return lower.contains(&pattern.to_lowercase());
    }
    if let Some(pattern) = expected.strip_prefix('%') {
        return lower.ends_with(&pattern.to_lowercase());
    }
    if let Some(pattern) = expected.strip_suffix('%') {
        return lower.starts_with(&pattern.to_lowercase());
    }
    actual == expected
}

/// Recursive structural equality. Differences are appended with the
/// path at which they occur; comparison stops at the first one.
fn compare(
    left: &Value,
    right: &Value,
    path: &str,
    differences: &mut Vec<String>,
) -> bool {
    if is_ignore(left) || is_ignore(right) {
        return true;
    }
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            for (key, lv) in l {
                let child = join_path(path, key);
                let Some(rv) = r.get(key) else {
                    differences.push(format!("Missing key in right at {child}"));
                    return false;
                };
                if !compare(lv, rv, &child, differences) {
                    return false;
                }
            }
            if let Some(key) = r.keys().find(|k| !l.contains_key(*k)) {
                differences.push(format!(
                    "Missing key in left at {}",
                    join_path(path, key)
                ));
                return false;
            }
            true
        }
        (Value::Array(l), Value::Array(r)) => {
            if l.len() != r.len() {
                differences.push(format!(
                    "Array size mismatch at {path}: {} vs {}",
                    l.len(),
                    r.len()
                ));
                return false;
            }
            l.iter().zip(r).enumerate().all(|(i, (lv, rv))| {
                compare(lv, rv, &format!("{path}[{i}]"), differences)
            })
        }
        (l, r) if !is_container(l) && !is_container(r) => {
            let equal = primitive_equal(l, r);
            if !equal {
                differences.push(format!("Value mismatch at {path}: {l} vs {r}"));
            }
            equal
        }
        (l, r) => {
            differences.push(format!("Type mismatch at {path}: {l} vs {r}"));
            false
        }
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn structurally_equal(left: &Value, right: &Value) -> bool {
    compare(left, right, "", &mut Vec::new())
}

/// Containment of `value` in `key`. `None` when the shapes cannot be
/// compared.
fn contains(key: &Value, value: &Value) -> Option<bool> {
    match (key, value) {
        (Value::String(container), Value::String(containee)) => {
            Some(container.contains(containee.as_str()))
        }
        (Value::Object(container), Value::Object(containee)) => {
            Some(containee.iter().all(|(k, v)| {
                container
                    .get(k)
                    .is_some_and(|cv| structurally_equal(cv, v))
            }))
        }
        (Value::Array(container), Value::Array(containee)) => {
            Some(containee.iter().all(|needle| {
                container.iter().any(|item| structurally_equal(item, needle))
            }))
        }
        (Value::Array(container), Value::Object(_)) => {
            Some(container.iter().any(|item| structurally_equal(item, value)))
        }
        (Value::Array(container), scalar) => {
            Some(container.iter().any(|item| primitive_equal(item, scalar)))
        }
        _ => None,
    }
}

fn parse_date(value: &Value) -> Option<NaiveDateTime> {
    let text = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    ["%Y-%m-%d", "%Y%m%d", "%Y/%m/%d"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(key: Value, value: Value, condition: Condition) -> bool {
        validate(&key, &value, condition).passed
    }

    #[test]
    fn test_wildcard_equality() {
        assert!(check(json!("hello world"), json!("%world%"), Condition::IsEqual));
        assert!(check(json!("hello world"), json!("%WORLD"), Condition::IsEqual));
        assert!(check(json!("hello world"), json!("Hello%"), Condition::IsEqual));
        assert!(!check(json!("hello world"), json!("%hello"), Condition::IsEqual));
        assert!(!check(json!("hello world"), json!("world%"), Condition::IsEqual));
        assert!(!check(json!("hello"), json!("Hello"), Condition::IsEqual));
        assert!(check(json!("hello"), json!("Hello"), Condition::IsNotEqual));
    }

    #[test]
    fn test_ignore_sentinel_matches_anything() {
        for actual in [json!(1), json!("x"), json!(null), json!({"a": [1]}), json!([1, 2])] {
            assert!(check(actual, json!(IGNORE_SENTINEL), Condition::IsEqual));
        }
        assert!(check(
            json!({"id": 7, "ts": "2024-01-01"}),
            json!({"id": 7, "ts": "${ignore}"}),
            Condition::IsEqual
        ));
    }

    #[test]
    fn test_structural_equality_reports_missing_key() {
        assert!(check(json!({"a": 1, "b": 2}), json!({"a": 1, "b": 2}), Condition::IsEqual));

        let verdict = validate(&json!({"a": 1}), &json!({"a": 1, "b": 2}), Condition::IsEqual);
        assert!(!verdict.passed);
        assert_eq!(verdict.reason, "Missing key in left at b");

        let verdict = validate(&json!({"a": [1, 2]}), &json!({"a": [1]}), Condition::IsEqual);
        assert_eq!(verdict.reason, "Array size mismatch at a: 2 vs 1");

        let verdict = validate(&json!({"a": {"b": 1}}), &json!({"a": [1]}), Condition::IsEqual);
        assert!(verdict.reason.starts_with("Type mismatch at a"));
    }

    #[test]
    fn test_numbers_compare_as_floats() {
        assert!(check(json!(1), json!(1.0), Condition::IsEqual));
        assert!(check(json!("1"), json!(1), Condition::IsEqual));
        assert!(check(json!("10"), json!(9), Condition::IsLargerThan));
        assert!(check(json!(3), json!("3"), Condition::IsLessThanOrEqual));
        assert!(!check(json!("abc"), json!(1), Condition::IsLargerThan));
        assert!(check(json!(1.00001), json!(1), Condition::IsApproximate4));
        assert!(check(json!(1.001), json!(1), Condition::IsNotApproximate4));
    }

    #[test]
    fn test_in_swaps_operands_for_arrays() {
        assert!(check(json!("b"), json!(["a", "b"]), Condition::IsIn));
        assert!(check(json!("c"), json!(["a", "b"]), Condition::IsNotIn));
        assert!(check(json!("ell"), json!("hello"), Condition::IsIn));
        assert!(check(json!("k"), json!({"k": 1}), Condition::IsIn));
        assert!(check(json!({"id": 1}), json!([{"id": 1}]), Condition::IsIn));
    }

    #[test]
    fn test_containment_shapes() {
        assert!(check(json!("abcdef"), json!("cde"), Condition::IsContain));
        assert!(check(json!({"a": 1, "b": 2}), json!({"b": 2}), Condition::IsJsonContain));
        assert!(!check(json!({"a": 1}), json!({"b": 2}), Condition::IsJsonContain));
        assert!(check(json!([1, 2, 3]), json!([3, 1]), Condition::IsContain));
        assert!(check(json!([{"id": 1}, {"id": 2}]), json!({"id": 2}), Condition::IsContain));
        assert!(check(json!(["x", "y"]), json!("y"), Condition::IsContain));
        assert!(check(json!(["x", "y"]), json!("z"), Condition::IsNotContain));
        // incomparable shapes fail both ways
        assert!(!check(json!(1), json!(1), Condition::IsContain));
        assert!(!check(json!(1), json!(1), Condition::IsNotContain));
    }

    #[test]
    fn test_regex_requires_strings_and_full_match() {
        assert!(check(json!("abc123"), json!("[a-z]+\\d+"), Condition::IsRegexMatch));
        assert!(!check(json!("abc123x"), json!("[a-z]+\\d+"), Condition::IsRegexMatch));
        assert!(check(json!("abc"), json!("\\d+"), Condition::IsRegexNotMatch));
        assert!(!check(json!(123), json!("\\d+"), Condition::IsRegexMatch));
        assert!(!check(json!(123), json!("\\d+"), Condition::IsRegexNotMatch));
    }

    #[test]
    fn test_length_null_bool_and_opposite() {
        assert!(check(json!("héllo"), json!(5), Condition::IsLengthEqual));
        assert!(check(json!([1, 2]), json!("1"), Condition::IsLengthLargerThan));
        assert!(check(json!({"a": 1}), json!(2), Condition::IsLengthLessThan));
        assert!(!check(json!(5), json!(1), Condition::IsLengthEqual));
        assert!(check(json!(null), json!(null), Condition::IsNull));
        assert!(check(json!(0), json!(null), Condition::IsNotNull));
        assert!(check(json!(true), json!(null), Condition::IsTrue));
        assert!(!check(json!("true"), json!(null), Condition::IsTrue));
        assert!(check(json!(false), json!(true), Condition::IsOpposite));
        assert!(check(json!(-4), json!(4), Condition::IsOpposite));
    }

    #[test]
    fn test_dates_in_mixed_formats() {
        assert!(check(json!("2024-03-01"), json!("20240301"), Condition::IsDateEqual));
        assert!(check(
            json!("2024-03-02 10:00:00"),
            json!("2024-03-01T23:00:00Z"),
            Condition::IsDateLargerThan
        ));
        assert!(!check(json!("not a date"), json!("2024-03-01"), Condition::IsDateNotEqual));
    }

    #[test]
    fn test_condition_names_parse_case_insensitively() {
        assert_eq!("isjsonequal".parse::<Condition>().unwrap(), Condition::IsJsonEqual);
        assert_eq!(" IsDateLessThan ".parse::<Condition>().unwrap(), Condition::IsDateLessThan);
        let err = "IsSomething".parse::<Condition>().unwrap_err();
        assert!(matches!(err, StepError::Configuration(_)));
        for condition in Condition::ALL {
            assert_eq!(condition.name().parse::<Condition>().unwrap(), condition);
        }
    }
}
