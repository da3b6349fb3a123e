//! Action groups and the HTTP/database actions they run.

use crate::db::{fold_rows, DbAction, SqlShape};
use crate::error::{Result, StepError};
use crate::http::{ApiRequest, ApiResponse, HttpAction, TransportError};
use crate::model::StepContext;
use crate::placeholder::ResolveScope;
use crate::retry::{retry, RetryPolicy};
use crate::step::StepExecutor;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const BEFORE_DEPENDENCY_KEY: &str = "beforeDependency";
pub const DEPENDENCY_KEY: &str = "dependency";
const BEFORE_WAIT_KEY: &str = "beforeWait";
const EXECUTE_KEY: &str = "execute";

/// Prefix of the test-data key holding a step's HTTP response.
pub const RESPONSE_KEY_PREFIX: &str = "response";

/// What a step's `test` entry asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind<'a> {
    None,
    Http(&'a Value),
    Database(Vec<&'a Value>),
}

impl<'a> ActionKind<'a> {
    /// An object with `sql` or an array is database work, any other
    /// object is an HTTP call.
    pub fn classify(test: Option<&'a Value>) -> Result<Self> {
        match test {
            None | Some(Value::Null) => Ok(ActionKind::None),
            Some(Value::Array(items)) => Ok(ActionKind::Database(items.iter().collect())),
            Some(value @ Value::Object(map)) if map.contains_key("sql") => {
                Ok(ActionKind::Database(vec![value]))
            }
            Some(value @ Value::Object(_)) => Ok(ActionKind::Http(value)),
            Some(other) => Err(StepError::configuration(format!(
                "Unsupported test definition: {other}"
            ))),
        }
    }
}

/// Entries of a group list sorted by their numeric `id`.
pub(crate) fn sorted_by_id(groups: Option<&Value>) -> Vec<&Value> {
    let mut sorted: Vec<&Value> = match groups {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    };
    sorted.sort_by(|a, b| group_id(a).total_cmp(&group_id(b)));
    sorted
}

pub(crate) fn group_id(group: &Value) -> f64 {
    group
        .get("id")
        .and_then(crate::validator::as_number)
        .unwrap_or(0.0)
}

pub(crate) fn group_label(group: &Value) -> String {
    group
        .get("id")
        .map(crate::validator::text_of)
        .unwrap_or_default()
}

impl StepExecutor {
    /// Run action groups in id order.
    ///
    /// Top-level groups may carry their own `beforeDependency` /
    /// `dependency` gate; inside such a gate (`nested`) gates are not
    /// evaluated again.
    pub(crate) fn run_action_groups<'a>(
        &'a self,
        ctx: &'a StepContext,
        groups: Option<&'a Value>,
        log: &'a mut Vec<String>,
        nested: bool,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            for group in sorted_by_id(groups) {
                let label = group_label(group);
                if !nested {
                    match self.nested_gate(ctx, group, log).await {
                        Ok(true) => {}
                        Ok(false) => {
                            log.push(format!(
                                "Skip action group {label} as its dependency is not met"
                            ));
                            continue;
                        }
                        Err(err) => {
                            warn!(group = %label, "Dependency of action group failed: {}", err);
                            log.push(format!(
                                "Skip action group {label} as its dependency failed: {err}"
                            ));
                            continue;
                        }
                    }
                }

                if let Some(wait) = group.get(BEFORE_WAIT_KEY).and_then(crate::validator::as_number) {
                    self.pause(ctx, wait).await?;
                }

                let actions = match group.get(EXECUTE_KEY) {
                    Some(Value::Array(items)) => items.iter().collect(),
                    Some(item @ Value::Object(_)) => vec![item],
                    _ => Vec::new(),
                };
                for action in actions {
                    self.execute_db_action(ctx, action, log).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Gate of an action or assertion group, one level deep.
    pub(crate) async fn nested_gate(
        &self,
        ctx: &StepContext,
        group: &Value,
        log: &mut Vec<String>,
    ) -> Result<bool> {
        self.run_action_groups(ctx, group.get(BEFORE_DEPENDENCY_KEY), log, true)
            .await?;
        match self
            .run_assertion_groups(ctx, group.get(DEPENDENCY_KEY), log, true)
            .await
        {
            Ok(()) => Ok(true),
            Err(StepError::Assertion(message)) => {
                debug!("Group dependency not met: {}", message.trim());
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn pause(&self, ctx: &StepContext, seconds: f64) -> Result<()> {
        if seconds <= 0.0 {
            return Ok(());
        }
        let wait = Duration::try_from_secs_f64(seconds).map_err(|err| {
            StepError::configuration(format!("Invalid beforeWait '{seconds}': {err}"))
        })?;
        debug!(seconds, "Waiting before action group");
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(StepError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    /// Run the step's `test` entry.
    pub(crate) async fn run_test_action(
        &self,
        ctx: &StepContext,
        test: Option<&Value>,
        log: &mut Vec<String>,
    ) -> Result<()> {
        match ActionKind::classify(test)? {
            ActionKind::None => {
                debug!(step_id = ctx.step_id, "Step has no action");
                Ok(())
            }
            ActionKind::Http(template) => {
                self.execute_http_action(ctx, template, log).await?;
                Ok(())
            }
            ActionKind::Database(actions) => {
                for action in actions {
                    self.execute_db_action(ctx, action, log).await?;
                }
                Ok(())
            }
        }
    }

    /// Resolve and run one database action, storing its folded result
    /// under `storedKey` when present.
    pub(crate) async fn execute_db_action(
        &self,
        ctx: &StepContext,
        template: &Value,
        log: &mut Vec<String>,
    ) -> Result<Value> {
        let resolved = self
            .resolver
            .resolve(ctx, template, &ResolveScope::default())
            .await?;
        let action: DbAction = serde_json::from_value(resolved).map_err(|err| {
            StepError::configuration(format!("Invalid database action: {err}"))
        })?;
        let connection = action.connection_name(ctx);
        let shape = SqlShape::parse(&action.sql);
        log.push(format!("Execute SQL on '{connection}': {}", action.sql));

        let policy = RetryPolicy::for_database(action.retry.as_ref());
        let rows = retry(
            &policy,
            &ctx.cancel,
            |attempt| {
                debug!(attempt, connection = %connection, "Running SQL");
                self.database.query(&connection, &action.sql, &action.params)
            },
            |rows| {
                policy
                    .stop_condition
                    .as_ref()
                    .map_or(true, |stop| stop.evaluate_rows(rows))
            },
        )
        .await?;

        let value = fold_rows(&shape, rows)?;
        log.push(format!("* Result: {value}"));
        if let Some(key) = action.stored_key.as_deref().filter(|k| !k.is_empty()) {
            self.store()
                .merge(&ctx.run_id, &ctx.case_id, key, value.clone())
                .await
                .map_err(|err| {
                    StepError::action(format!("Failed to store '{key}': {err}"))
                })?;
            log.push(format!("* Stored result as '{key}'"));
        }
        Ok(value)
    }

    /// Resolve and send one HTTP action, saving the response under
    /// `response<stepId>`.
    pub(crate) async fn execute_http_action(
        &self,
        ctx: &StepContext,
        template: &Value,
        log: &mut Vec<String>,
    ) -> Result<ApiResponse> {
        let resolved = self
            .resolver
            .resolve(ctx, template, &ResolveScope::default())
            .await?;
        let action: HttpAction = serde_json::from_value(resolved).map_err(|err| {
            StepError::configuration(format!("Invalid HTTP action: {err}"))
        })?;
        let base_url = action
            .base_url
            .clone()
            .filter(|url| !url.is_empty())
            .or_else(|| {
                action.service_name.as_deref().and_then(|service| {
                    self.settings
                        .base_url(service, &ctx.profile())
                        .map(str::to_string)
                })
            })
            .ok_or_else(|| StepError::configuration("Error: baseUrl is null"))?;
        let request = ApiRequest::new(base_url, &action);

        log.push(
            "------------------------------------------------------------------".to_string(),
        );
        log.push(format!("API Trigger for Step: '{}'", ctx.step_name));
        log.push(format!("BaseUrl: {}", request.base_url));
        log.push(format!("Path: {}", request.expanded_path()));
        log.push(format!("Method: {}", request.method));
        log.push(format!(
            "Request: {}",
            serde_json::to_string(&action.request).unwrap_or_default()
        ));

        let policy = RetryPolicy::for_http(action.retry.as_ref());
        let attempts = retry(
            &policy,
            &ctx.cancel,
            |attempt| {
                debug!(attempt, "Sending HTTP request");
                self.transport.send(&request)
            },
            |response: &ApiResponse| {
                policy
                    .stop_condition
                    .as_ref()
                    .map_or(true, |stop| stop.evaluate_body(&response.body))
            },
        );
        let deadline = self.settings.request_timeout;
        let response = match tokio::time::timeout(deadline, attempts).await {
            Err(_) => {
                warn!(step_id = ctx.step_id, "HTTP action exceeded {:?}", deadline);
                return Err(StepError::Timeout(deadline.as_secs()));
            }
            Ok(Ok(response)) => response,
            Ok(Err(TransportError::Cancelled)) => return Err(StepError::Cancelled),
            Ok(Err(err)) => {
                warn!(step_id = ctx.step_id, "HTTP action failed: {}", err);
                err.into_response()
            }
        };
        info!(step_id = ctx.step_id, status = response.status, "HTTP action completed");
        log.push(format!("* StatusCode: {}", response.status));
        log.push(format!("* Response: {}", response.body));

        let key = format!("{RESPONSE_KEY_PREFIX}{}", ctx.step_id);
        self.store()
            .merge(&ctx.run_id, &ctx.case_id, &key, response.to_test_data())
            .await
            .map_err(|err| StepError::action(format!("Failed to save response: {err}")))?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_actions() {
        assert_eq!(ActionKind::classify(None).unwrap(), ActionKind::None);
        let db = json!({"sql": "select 1"});
        assert_eq!(
            ActionKind::classify(Some(&db)).unwrap(),
            ActionKind::Database(vec![&db])
        );
        let list = json!([{"sql": "a"}, {"sql": "b"}]);
        assert!(matches!(
            ActionKind::classify(Some(&list)).unwrap(),
            ActionKind::Database(items) if items.len() == 2
        ));
        let http = json!({"path": "/x"});
        assert_eq!(ActionKind::classify(Some(&http)).unwrap(), ActionKind::Http(&http));
        assert!(ActionKind::classify(Some(&json!("GET /x"))).is_err());
    }

    #[test]
    fn test_groups_sorted_by_numeric_id() {
        let groups = json!([{"id": 10}, {"id": "2"}, {"id": 1.5}, {}]);
        let ids: Vec<String> = sorted_by_id(Some(&groups))
            .into_iter()
            .map(group_label)
            .collect();
        assert_eq!(ids, vec!["", "1.5", "2", "10"]);
    }
}
