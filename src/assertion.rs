//! Assertion groups: loops, gates, pre-assert actions and the
//! assertion list itself.

use crate::action::{group_label, sorted_by_id};
use crate::error::{Result, StepError};
use crate::loop_expander::{assert_loop_marker, expand_loop, BEFORE_LOOP_KEY};
use crate::model::StepContext;
use crate::placeholder::ResolveScope;
use crate::step::StepExecutor;
use crate::validator::{text_of, validate, Condition};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

const BEFORE_ASSERT_KEY: &str = "beforeAssert";
const ASSERT_KEY: &str = "assert";

pub const MISSING_DESCRIPTION: &str = "Missing Assert Description";

/// A single `{key, condition, value, description}` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionItem {
    #[serde(default)]
    pub key: Value,
    pub condition: Condition,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub description: Option<String>,
}

impl AssertionItem {
    pub fn description(&self) -> &str {
        self.description
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(MISSING_DESCRIPTION)
    }

    /// Validate the (already resolved) item.
    ///
    /// Returns the success line, or the failure block as an assertion
    /// error.
    pub fn check(&self) -> Result<String> {
        let verdict = validate(&self.key, &self.value, self.condition);
        if verdict.passed {
            Ok(format!("Success: Assertion passed for '{}'", self.description()))
        } else {
            Err(StepError::Assertion(format!(
                "\nError: Assertion failed for '{}'\ncondition: {}\nkey: {}\nvalue: {}\nwith reason: {}",
                self.description(),
                self.condition.name(),
                text_of(&self.key),
                text_of(&self.value),
                verdict.reason
            )))
        }
    }
}

/// Parse an `assert` list. Unknown condition names are configuration
/// errors.
pub fn parse_assertions(value: Option<&Value>) -> Result<Vec<AssertionItem>> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items.clone(),
        Some(item @ Value::Object(_)) => vec![item.clone()],
        Some(other) => {
            return Err(StepError::configuration(format!(
                "Invalid assert list: {other}"
            )))
        }
    };
    items
        .into_iter()
        .map(|item| {
            if let Some(Value::String(name)) = item.get("condition") {
                name.parse::<Condition>()?;
            }
            serde_json::from_value(item).map_err(|err| {
                StepError::configuration(format!("Invalid assertion: {err}"))
            })
        })
        .collect()
}

impl StepExecutor {
    /// Run assertion groups in id order; the first failing assertion
    /// ends the run with [`StepError::Assertion`].
    pub(crate) fn run_assertion_groups<'a>(
        &'a self,
        ctx: &'a StepContext,
        groups: Option<&'a Value>,
        log: &'a mut Vec<String>,
        nested: bool,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            for group in sorted_by_id(groups) {
                let label = group_label(group);
                self.run_action_groups(ctx, group.get(BEFORE_LOOP_KEY), log, nested)
                    .await?;
                let instances =
                    expand_loop(&self.resolver, ctx, group, &assert_loop_marker(&label)).await?;
                let multiple = instances.len() > 1;

                for (index, instance) in instances {
                    let name = if multiple {
                        format!("{label} (Loop {index})")
                    } else {
                        label.clone()
                    };
                    if !nested {
                        match self.nested_gate(ctx, &instance, log).await {
                            Ok(true) => {}
                            Ok(false) => {
                                log.push(format!(
                                    "Skip assertion group {name} as its dependency is not met"
                                ));
                                continue;
                            }
                            Err(err) => {
                                warn!(group = %name, "Dependency of assertion group failed: {}", err);
                                log.push(format!(
                                    "Skip assertion group {name} as its dependency failed: {err}"
                                ));
                                continue;
                            }
                        }
                    }
                    self.run_action_groups(ctx, instance.get(BEFORE_ASSERT_KEY), log, nested)
                        .await?;
                    self.run_assertions(ctx, instance.get(ASSERT_KEY), log).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn run_assertions(
        &self,
        ctx: &StepContext,
        assertions: Option<&Value>,
        log: &mut Vec<String>,
    ) -> Result<()> {
        let Some(assertions) = assertions else {
            return Ok(());
        };
        let resolved = self
            .resolver
            .resolve(ctx, assertions, &ResolveScope::default())
            .await?;
        for item in parse_assertions(Some(&resolved))? {
            debug!(condition = item.condition.name(), "Checking assertion");
            match item.check() {
                Ok(line) => log.push(line),
                Err(err) => {
                    info!(step_id = ctx.step_id, "Assertion failed: {}", item.description());
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_passing_item_reports_description() {
        let item: AssertionItem = serde_json::from_value(json!({
            "key": 200,
            "condition": "isEqual",
            "value": "200",
            "description": "status is OK"
        }))
        .unwrap();
        assert_eq!(
            item.check().unwrap(),
            "Success: Assertion passed for 'status is OK'"
        );
    }

    #[test]
    fn test_failing_item_builds_block() {
        let item: AssertionItem = serde_json::from_value(json!({
            "key": "abc",
            "condition": "IsContain",
            "value": "z"
        }))
        .unwrap();
        let err = item.check().unwrap_err();
        let StepError::Assertion(block) = err else {
            panic!("expected assertion failure");
        };
        assert!(block.starts_with("\nError: Assertion failed for 'Missing Assert Description'"));
        assert!(block.contains("\ncondition: IsContain\nkey: abc\nvalue: z\nwith reason: "));
    }

    #[test]
    fn test_unknown_condition_is_configuration_error() {
        let err = parse_assertions(Some(&json!([
            {"key": 1, "condition": "IsRoughly", "value": 1}
        ])))
        .unwrap_err();
        assert!(matches!(err, StepError::Configuration(_)));
        assert!(parse_assertions(None).unwrap().is_empty());
    }
}
