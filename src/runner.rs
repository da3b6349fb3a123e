//! Case execution

use crate::config::RunnerConfig;
use crate::db::RelationalClient;
use crate::http::{HttpTransport, ReqwestTransport};
use crate::model::{CaseDefinition, CaseResult, StepContext};
use crate::pg::PgRelationalClient;
use crate::placeholder::{required_placeholders, PlaceholderResolver};
use crate::source::{VariableCatalog, VariableSources};
use crate::step::{ExecutorSettings, StepExecutor};
use crate::store::{MemoryTestDataStore, TestDataStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Case runner trait
#[async_trait]
pub trait CaseRunner: Send + Sync {
    /// Execute one case
    async fn run(&self, case: &CaseDefinition) -> Result<CaseResult>;
}

/// Run `cases` with at most `parallelism` in flight. Results keep the
/// input order.
pub async fn run_all<R>(
    runner: &R,
    cases: &[CaseDefinition],
    parallelism: usize,
) -> Vec<Result<CaseResult>>
where
    R: CaseRunner + ?Sized,
{
    stream::iter(cases)
        .map(|case| runner.run(case))
        .buffered(parallelism.max(1))
        .collect()
        .await
}

/// Placeholder names a case needs from outside its own steps. Keys
/// stored by any step of the case count as supplied.
pub fn required_case_placeholders(case: &CaseDefinition) -> BTreeSet<String> {
    let definitions: Vec<Value> = case
        .steps
        .iter()
        .map(|step| Value::Object(step.definition.clone()))
        .collect();
    required_placeholders(&Value::Array(definitions))
}

/// Required placeholders with neither a value in `data` nor a declared
/// variable source.
pub fn unbound_case_placeholders(
    case: &CaseDefinition,
    data: &Map<String, Value>,
) -> BTreeSet<String> {
    required_case_placeholders(case)
        .into_iter()
        .filter(|name| {
            let root = name.split('.').next().unwrap_or(name);
            !data.contains_key(root)
                && !case.variables.contains_key(root)
                && !case.variables.contains_key(name.as_str())
        })
        .collect()
}

/// Default case runner
pub struct DefaultCaseRunner {
    run_id: String,
    config: RunnerConfig,
    settings: Arc<ExecutorSettings>,
    transport: Arc<dyn HttpTransport>,
    database: Arc<dyn RelationalClient>,
    store: Arc<dyn TestDataStore>,
    catalog: Arc<dyn VariableCatalog>,
    seed_store: bool,
    debug: bool,
    cancel: CancellationToken,
}

impl DefaultCaseRunner {
    /// Runner over reqwest, Postgres connections from `config` and an
    /// in-memory test-data store.
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            settings: Arc::new(config.executor_settings()),
            transport: Arc::new(ReqwestTransport::new()),
            database: Arc::new(PgRelationalClient::new(config.databases.clone())),
            store: Arc::new(MemoryTestDataStore::new()),
            catalog: Arc::new(config.static_catalog()),
            seed_store: true,
            debug: false,
            cancel: CancellationToken::new(),
            config,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_database(mut self, database: Arc<dyn RelationalClient>) -> Self {
        self.database = database;
        self
    }

    /// Use a persisted store. Its documents already hold the case test
    /// data, so it is not seeded.
    pub fn with_store(mut self, store: Arc<dyn TestDataStore>) -> Self {
        self.store = store;
        self.seed_store = false;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn VariableCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// In debug mode every case gets its own in-memory store.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Stop in-flight and pending steps.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn store_for(&self, case: &CaseDefinition) -> Result<Arc<dyn TestDataStore>> {
        if self.debug {
            debug!("Using in-memory test data for case {}", case.case_id);
            return Ok(Arc::new(MemoryTestDataStore::seeded(
                &self.run_id,
                &case.case_id,
                case.test_data.clone(),
            )));
        }
        if self.seed_store {
            for (key, value) in &case.test_data {
                self.store
                    .merge(&self.run_id, &case.case_id, key, value.clone())
                    .await
                    .context(format!("Failed to seed test data for case {}", case.case_id))?;
            }
        }
        Ok(self.store.clone())
    }

    async fn warn_unbound(&self, case: &CaseDefinition, store: &dyn TestDataStore) {
        let data = match store.get(&self.run_id, &case.case_id).await {
            Ok(data) => data,
            Err(err) => {
                debug!("Skipping placeholder check: {}", err);
                return;
            }
        };
        let unbound = unbound_case_placeholders(case, &data);
        if !unbound.is_empty() {
            warn!(
                "Case {} uses placeholders with no test data or source: {:?}",
                case.case_id, unbound
            );
        }
    }
}

#[async_trait]
impl CaseRunner for DefaultCaseRunner {
    #[instrument(skip(self, case), fields(run_id = %self.run_id, case_id = %case.case_id))]
    async fn run(&self, case: &CaseDefinition) -> Result<CaseResult> {
        let started_at = Utc::now();
        let start_time = Instant::now();
        info!("Starting case: {}", case.display_name());

        let store = self.store_for(case).await?;
        self.warn_unbound(case, store.as_ref()).await;
        let resolver =
            PlaceholderResolver::new(VariableSources::new(store, self.catalog.clone()));
        let executor = StepExecutor::new(
            resolver,
            self.transport.clone(),
            self.database.clone(),
            self.settings.clone(),
        );
        let ctx = StepContext::for_case(&self.run_id, case, self.cancel.child_token());

        let steps = case.ordered_steps();
        let mut success = true;
        let mut reports = Vec::with_capacity(steps.len());
        for (position, spec) in steps.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                warn!("Case cancelled before step {}", spec.id);
                success = false;
                break;
            }
            info!(
                "Running step {}/{}: {}",
                position + 1,
                steps.len(),
                spec.name
            );

            let report = executor.run_step(&ctx, spec).await;
            let failed = report.status.is_failure();
            reports.push(report);

            if failed {
                success = false;
                if !self.config.continue_on_failure {
                    info!("Stopping case due to step failure");
                    break;
                }
            }
        }

        let result = CaseResult {
            run_id: self.run_id.clone(),
            case_id: case.case_id.clone(),
            name: case.display_name().to_string(),
            success,
            started_at,
            duration_ms: start_time.elapsed().as_millis() as u64,
            steps: reports,
        };

        info!(
            "Case finished: {} ({} ms) - Success: {}",
            result.name, result.duration_ms, result.success
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbError, Row};
    use crate::http::{ApiRequest, ApiResponse, TransportError};
    use crate::model::StepStatus;
    use serde_json::json;

    struct EchoTransport;

    #[async_trait]
    impl HttpTransport for EchoTransport {
        async fn send(
            &self,
            request: &ApiRequest,
        ) -> std::result::Result<ApiResponse, TransportError> {
            let status = if request.expanded_path().ends_with("/fail") { 500 } else { 200 };
            Ok(ApiResponse {
                status,
                headers: Default::default(),
                body: json!({"path": request.expanded_path()}).to_string(),
            })
        }
    }

    struct NoDatabase;

    #[async_trait]
    impl RelationalClient for NoDatabase {
        async fn query(
            &self,
            connection: &str,
            _sql: &str,
            _params: &[Value],
        ) -> std::result::Result<Vec<Row>, DbError> {
            Err(DbError::UnknownConnection(connection.to_string()))
        }
    }

    fn case(case_id: &str, paths: &[&str]) -> CaseDefinition {
        let steps: Vec<Value> = paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                json!({
                    "id": i + 1,
                    "name": format!("step {}", i + 1),
                    "test": {"baseUrl": "http://svc", "path": path},
                    "afterTest": [{"id": 1, "assert": [{
                        "key": format!("{{{{response{}.statusCode}}}}", i + 1),
                        "condition": "IsEqual",
                        "value": 200
                    }]}]
                })
            })
            .collect();
        serde_json::from_value(json!({
            "caseId": case_id,
            "region": "apac",
            "env": "uat",
            "testData": {"user": "u1"},
            "steps": steps
        }))
        .unwrap()
    }

    fn runner(config: RunnerConfig) -> DefaultCaseRunner {
        DefaultCaseRunner::new(config)
            .with_run_id("run-1")
            .with_transport(Arc::new(EchoTransport))
            .with_database(Arc::new(NoDatabase))
    }

    #[tokio::test]
    async fn test_failed_step_stops_case() {
        let result = runner(RunnerConfig::default())
            .run(&case("c1", &["/ok", "/fail", "/ok"]))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[1].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_continue_on_failure_runs_every_step() {
        let config = RunnerConfig {
            continue_on_failure: true,
            ..Default::default()
        };
        let result = runner(config)
            .run(&case("c1", &["/fail", "/ok"]))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[1].status, StepStatus::Passed);
    }

    #[tokio::test]
    async fn test_run_all_keeps_input_order() {
        let cases = vec![case("a", &["/ok"]), case("b", &["/fail"]), case("c", &["/ok"])];
        let runner = runner(RunnerConfig::default()).with_debug(true);
        let results = run_all(&runner, &cases, 3).await;
        let summary: Vec<(String, bool)> = results
            .into_iter()
            .map(|r| r.unwrap())
            .map(|r| (r.case_id, r.success))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a".to_string(), true),
                ("b".to_string(), false),
                ("c".to_string(), true)
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_runner_runs_no_steps() {
        let runner = runner(RunnerConfig::default());
        runner.cancel();
        let result = runner.run(&case("c1", &["/ok"])).await.unwrap();
        assert!(!result.success);
        assert!(result.steps.is_empty());
    }

    #[test]
    fn test_required_placeholders_skip_responses() {
        let case: CaseDefinition = serde_json::from_value(json!({
            "caseId": "c",
            "steps": [{
                "id": 1,
                "name": "s",
                "test": {"path": "/u/{{user}}"},
                "afterTest": [{"assert": [{"key": "{{response1.statusCode}}", "condition": "IsEqual", "value": 200}]}]
            }]
        }))
        .unwrap();
        assert_eq!(
            required_case_placeholders(&case),
            BTreeSet::from(["user".to_string()])
        );
    }

    #[test]
    fn test_unbound_placeholders_ignore_supplied_names() {
        let case: CaseDefinition = serde_json::from_value(json!({
            "caseId": "c",
            "variables": {"limit": "Component"},
            "steps": [
                {"id": 1, "name": "find", "test": {"sql": "select id from t where u = '{{user.name}}'", "storedKey": "orderId"}},
                {"id": 2, "name": "read", "test": {"path": "/o/{{orderId}}/{{limit}}/{{region}}"}}
            ]
        }))
        .unwrap();
        assert_eq!(
            required_case_placeholders(&case),
            BTreeSet::from(["limit".to_string(), "region".to_string(), "user.name".to_string()])
        );
        let data = json!({"user": {"name": "amy"}}).as_object().cloned().unwrap();
        assert_eq!(
            unbound_case_placeholders(&case, &data),
            BTreeSet::from(["region".to_string()])
        );
    }
}
