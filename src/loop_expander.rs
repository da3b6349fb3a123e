//! Expansion of looped templates into indexed instances.
//!
//! A template with `"loop": "{{orders}}"` becomes one copy per element
//! of `orders`. Inside copy `i` every `[[marker]]` or `[[marker.path]]`
//! is rewritten to `{{orders.<i-1>}}` / `{{orders.<i-1>.path}}`, which
//! the placeholder resolver binds when the instance runs. The marker is
//! either the loop key of the template kind or the loop name itself.

use crate::error::{Result, StepError};
use crate::model::StepContext;
use crate::placeholder::{PlaceholderResolver, ResolveScope};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

pub const LOOP_KEY: &str = "loop";
pub const BEFORE_LOOP_KEY: &str = "beforeLoop";

/// Marker for step-level loops.
pub const STEP_LOOP_MARKER: &str = "stepLoopObject";

/// Marker for the loop of the assertion group `group_id`.
pub fn assert_loop_marker(group_id: &str) -> String {
    format!("assertLoopObject{group_id}")
}

/// Expand `template` into instances keyed `1..=N`.
///
/// Without a `loop` key the template is returned unchanged as instance
/// 1. An empty array yields no instances.
pub async fn expand_loop(
    resolver: &PlaceholderResolver,
    ctx: &StepContext,
    template: &Value,
    marker: &str,
) -> Result<BTreeMap<usize, Value>> {
    let loop_expr = match template.get(LOOP_KEY) {
        None | Some(Value::Null) => return Ok(BTreeMap::from([(1, template.clone())])),
        Some(Value::String(expr)) => expr.trim().to_string(),
        Some(other) => {
            return Err(StepError::resolution(format!(
                "The loop expression must name a placeholder, got {other}"
            )))
        }
    };

    let loop_name = loop_expr
        .trim_start_matches("{{")
        .trim_end_matches("}}")
        .trim()
        .to_string();
    if loop_name.is_empty() {
        return Err(unresolved(&loop_expr));
    }

    let items = match resolver
        .resolve(ctx, &Value::String(format!("{{{{{loop_name}}}}}")), &ResolveScope::default())
        .await?
    {
        Value::Array(items) => items,
        Value::Null => return Err(unresolved(&loop_expr)),
        Value::String(text) if text.contains("{{") => return Err(unresolved(&loop_expr)),
        other => {
            return Err(StepError::resolution(format!(
                "The value for loop '{loop_expr}' is not an array: {other}"
            )))
        }
    };
    debug!(loop_name = %loop_name, size = items.len(), "Expanding loop");

    let mut body = template.clone();
    if let Value::Object(map) = &mut body {
        map.remove(LOOP_KEY);
        map.remove(BEFORE_LOOP_KEY);
    }

    let marker_re = Regex::new(&format!(
        r"\[\[(?:{}|{})(\.[^\]]*?)?\]\]",
        regex::escape(marker),
        regex::escape(&loop_name)
    ))
    .map_err(|err| StepError::resolution(format!("Invalid loop marker '{marker}': {err}")))?;

    Ok((0..items.len())
        .map(|i| {
            let binding = format!("{loop_name}.{i}");
            (i + 1, bind_markers(&body, &marker_re, &binding))
        })
        .collect())
}

fn unresolved(loop_expr: &str) -> StepError {
    StepError::resolution(format!(
        "Error: The value for loop '{loop_expr}' seems be null, please check!"
    ))
}

fn bind_markers(value: &Value, marker_re: &Regex, binding: &str) -> Value {
    match value {
        Value::String(text) => Value::String(
            marker_re
                .replace_all(text, |caps: &Captures| {
                    let path = caps.get(1).map_or("", |m| m.as_str());
                    format!("{{{{{binding}{path}}}}}")
                })
                .into_owned(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| bind_markers(item, marker_re, binding))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), bind_markers(v, marker_re, binding)))
                .collect(),
        ),
        other => other.clone(),
    }
}
