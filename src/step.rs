//! Step execution: loop expansion, dependency gate, action, assertions
//! and rollback for every instance of a logical step.

use crate::action::{BEFORE_DEPENDENCY_KEY, DEPENDENCY_KEY};
use crate::db::RelationalClient;
use crate::error::{Result, StepError};
use crate::http::HttpTransport;
use crate::loop_expander::{expand_loop, BEFORE_LOOP_KEY, STEP_LOOP_MARKER};
use crate::model::{StepContext, StepOutcome, StepReport, StepSpec, StepStatus, FAILURE_BANNER};
use crate::placeholder::PlaceholderResolver;
use crate::source::GLOBAL_PROFILE;
use crate::store::TestDataStore;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const BEFORE_TEST_KEY: &str = "beforeTest";
const TEST_KEY: &str = "test";
const AFTER_TEST_KEY: &str = "afterTest";
const BEFORE_END_KEY: &str = "beforeEnd";
const ROLLBACK_FLAG_KEY: &str = "ifRollBack";

pub const ASSERT_BANNER: &str = "\nAssert after API Request\n---------------------------------\n";

/// Settings shared by every step of a run.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Deadline for one HTTP action, retries included.
    pub request_timeout: Duration,
    /// Service name to profile (`region+env`) to base URL.
    pub base_urls: HashMap<String, HashMap<String, String>>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            base_urls: HashMap::new(),
        }
    }
}

impl ExecutorSettings {
    /// Base URL of `service` for `profile`, falling back to the
    /// `GLOBAL` entry.
    pub fn base_url(&self, service: &str, profile: &str) -> Option<&str> {
        let profiles = self.base_urls.get(service)?;
        let find = |wanted: &str| {
            profiles
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
                .map(|(_, url)| url.as_str())
        };
        find(profile).or_else(|| find(GLOBAL_PROFILE))
    }
}

/// Runs logical steps against the configured collaborators.
#[derive(Clone)]
pub struct StepExecutor {
    pub(crate) resolver: PlaceholderResolver,
    pub(crate) transport: Arc<dyn HttpTransport>,
    pub(crate) database: Arc<dyn RelationalClient>,
    pub(crate) settings: Arc<ExecutorSettings>,
}

impl StepExecutor {
    pub fn new(
        resolver: PlaceholderResolver,
        transport: Arc<dyn HttpTransport>,
        database: Arc<dyn RelationalClient>,
        settings: Arc<ExecutorSettings>,
    ) -> Self {
        Self {
            resolver,
            transport,
            database,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn TestDataStore> {
        self.resolver.sources().store()
    }

    /// Run every instance of `spec` and record the aggregate status.
    #[instrument(skip_all, fields(case_id = %case_ctx.case_id, step_id = spec.id))]
    pub async fn run_step(&self, case_ctx: &StepContext, spec: &StepSpec) -> StepReport {
        let ctx = case_ctx.for_step(spec);
        info!(name = %spec.name, "Running step");

        let instances = match self.expand(&ctx).await {
            Ok(instances) => {
                let multiple = instances.len() > 1;
                let mut outcomes = Vec::with_capacity(instances.len());
                for (index, definition) in instances {
                    let name = if multiple {
                        format!("{} (Loop {index})", spec.name)
                    } else {
                        spec.name.clone()
                    };
                    let instance = ctx.with_iteration(index, name, definition);
                    outcomes.push(self.run_instance(&instance).await);
                }
                outcomes
            }
            Err((log, err)) => vec![finish(&ctx, Instant::now(), log, Err(err))],
        };

        let status = StepReport::aggregate(&instances);
        if let Err(err) = self
            .store()
            .record_step_status(&ctx.run_id, &ctx.case_id, spec.id, status.report_label())
            .await
        {
            warn!("Failed to record status of step {}: {}", spec.id, err);
        }
        info!(status = %status, "Step finished");

        StepReport {
            step_id: spec.id,
            name: spec.name.clone(),
            status,
            instances,
        }
    }

    /// `beforeLoop` actions, then one definition per loop element.
    async fn expand(
        &self,
        ctx: &StepContext,
    ) -> std::result::Result<BTreeMap<usize, Value>, (Vec<String>, StepError)> {
        let mut log = vec![header(ctx)];
        let definition = ctx.definition.clone();
        self.run_action_groups(ctx, definition.get(BEFORE_LOOP_KEY), &mut log, false)
            .await
            .map_err(|err| (log.clone(), err))?;
        expand_loop(&self.resolver, ctx, &definition, STEP_LOOP_MARKER)
            .await
            .map_err(|err| (log, err))
    }

    async fn run_instance(&self, ctx: &StepContext) -> StepOutcome {
        let started = Instant::now();
        let mut log = vec![header(ctx)];
        let result = self.run_stages(ctx, &mut log).await;
        finish(ctx, started, log, result)
    }

    async fn run_stages(&self, ctx: &StepContext, log: &mut Vec<String>) -> Result<StepStatus> {
        let definition = ctx.definition.clone();

        self.run_action_groups(ctx, definition.get(BEFORE_DEPENDENCY_KEY), log, false)
            .await?;
        match self
            .run_assertion_groups(ctx, definition.get(DEPENDENCY_KEY), log, false)
            .await
        {
            Ok(()) => {}
            Err(StepError::Assertion(message)) => {
                debug!("Dependency not met: {}", message.trim());
                log.push("Skip step as its dependency is not met".to_string());
                return Ok(StepStatus::Skipped);
            }
            Err(err) => return Err(err),
        }

        self.run_action_groups(ctx, definition.get(BEFORE_TEST_KEY), log, false)
            .await?;
        self.run_test_action(ctx, definition.get(TEST_KEY), log).await?;

        log.push(ASSERT_BANNER.to_string());
        let asserted = self
            .run_assertion_groups(ctx, definition.get(AFTER_TEST_KEY), log, false)
            .await;
        if rollback_enabled(&definition) {
            let rolled_back = self
                .run_action_groups(ctx, definition.get(BEFORE_END_KEY), log, false)
                .await;
            asserted.and(rolled_back)?;
        } else {
            asserted?;
        }
        Ok(StepStatus::Passed)
    }
}

fn header(ctx: &StepContext) -> String {
    format!(
        "RunId={}, caseId={}, stepId={}, index={}",
        ctx.run_id, ctx.case_id, ctx.step_id, ctx.index
    )
}

fn rollback_enabled(definition: &Value) -> bool {
    match definition.get(ROLLBACK_FLAG_KEY) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(flag)) => flag.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn finish(
    ctx: &StepContext,
    started: Instant,
    mut output: Vec<String>,
    result: Result<StepStatus>,
) -> StepOutcome {
    let (status, error_message) = match result {
        Ok(status) => (status, String::new()),
        Err(err) => {
            let status = match err {
                StepError::Timeout(_) => StepStatus::TimeOut,
                _ => StepStatus::Failed,
            };
            let message = format!("{FAILURE_BANNER}\n{err}");
            output.push(message.clone());
            (status, message)
        }
    };
    StepOutcome {
        step_id: ctx.step_id,
        name: ctx.step_name.clone(),
        index: ctx.index,
        status,
        duration_ms: started.elapsed().as_millis() as u64,
        output,
        error_message,
    }
}
