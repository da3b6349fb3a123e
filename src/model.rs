//! Case and step data model.

use crate::source::SourceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Prefix of every failure block in a step's error message.
pub const FAILURE_BANNER: &str = "\n\n\nFailed Reason:\n\
    ----------------------------------------------------------------------";

/// Status of a step instance or a logical step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
    Continue,
    TimeOut,
}

impl StepStatus {
    /// Label used in reports. A timeout is reported as a failure.
    pub fn report_label(&self) -> &'static str {
        match self {
            StepStatus::Passed => "passed",
            StepStatus::Failed | StepStatus::TimeOut => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Continue => "continue",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::TimeOut)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepStatus::Passed => "Passed",
            StepStatus::Failed => "Failed",
            StepStatus::Skipped => "Skipped",
            StepStatus::Continue => "Continue",
            StepStatus::TimeOut => "TimeOut",
        };
        f.write_str(name)
    }
}

/// A test case: an ordered set of JSON step definitions plus the data
/// they run against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseDefinition {
    pub case_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub env: String,
    /// Placeholder name to variable source. Names not listed here
    /// resolve against test data.
    #[serde(default)]
    pub variables: HashMap<String, SourceKind>,
    /// Initial test data for the case.
    #[serde(default)]
    pub test_data: Map<String, Value>,
    /// Scenario columns readable through the `Scenario` source.
    #[serde(default)]
    pub scenario: Map<String, Value>,
    pub steps: Vec<StepSpec>,
}

impl CaseDefinition {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.case_id)
    }

    /// Steps in ascending id order.
    pub fn ordered_steps(&self) -> Vec<&StepSpec> {
        let mut steps: Vec<&StepSpec> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.id);
        steps
    }
}

/// One logical step. Everything besides `id` and `name` is the step
/// definition (`beforeDependency`, `dependency`, `loop`, `test`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: u64,
    pub name: String,
    #[serde(flatten)]
    pub definition: Map<String, Value>,
}

/// Identity and inputs of one step instance.
///
/// Values are never mutated across iterations; each loop instance gets
/// its own copy through [`StepContext::with_iteration`].
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: String,
    pub case_id: String,
    pub region: String,
    pub env: String,
    pub variables: Arc<HashMap<String, SourceKind>>,
    pub scenario: Arc<Map<String, Value>>,
    pub step_id: u64,
    pub step_name: String,
    pub index: usize,
    pub definition: Arc<Value>,
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn new(
        run_id: impl Into<String>,
        case_id: impl Into<String>,
        region: impl Into<String>,
        env: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            case_id: case_id.into(),
            region: region.into(),
            env: env.into(),
            variables: Arc::new(HashMap::new()),
            scenario: Arc::new(Map::new()),
            step_id: 0,
            step_name: String::new(),
            index: 1,
            definition: Arc::new(Value::Object(Map::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Context for the first step of `case`.
    pub fn for_case(
        run_id: impl Into<String>,
        case: &CaseDefinition,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            variables: Arc::new(case.variables.clone()),
            scenario: Arc::new(case.scenario.clone()),
            cancel,
            ..Self::new(run_id, &case.case_id, &case.region, &case.env)
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, SourceKind>) -> Self {
        self.variables = Arc::new(variables);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Copy positioned on a logical step.
    pub fn for_step(&self, spec: &StepSpec) -> Self {
        Self {
            step_id: spec.id,
            step_name: spec.name.clone(),
            index: 1,
            definition: Arc::new(Value::Object(spec.definition.clone())),
            ..self.clone()
        }
    }

    /// Copy positioned on one loop instance of the current step.
    pub fn with_iteration(
        &self,
        index: usize,
        step_name: impl Into<String>,
        definition: Value,
    ) -> Self {
        Self {
            index,
            step_name: step_name.into(),
            definition: Arc::new(definition),
            ..self.clone()
        }
    }

    /// Region and environment, the key of the profile-scoped tiers.
    pub fn profile(&self) -> String {
        format!("{}{}", self.region, self.env)
    }
}

/// Result of one step instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub step_id: u64,
    pub name: String,
    pub index: usize,
    pub status: StepStatus,
    pub duration_ms: u64,
    /// Ordered log lines of the instance.
    pub output: Vec<String>,
    /// Empty on success, otherwise starts with [`FAILURE_BANNER`].
    pub error_message: String,
}

impl StepOutcome {
    pub fn report_status(&self) -> &'static str {
        self.status.report_label()
    }
}

/// Result of a logical step: every loop instance plus the aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub step_id: u64,
    pub name: String,
    pub status: StepStatus,
    pub instances: Vec<StepOutcome>,
}

impl StepReport {
    /// Aggregate status over instances in iteration order.
    ///
    /// A single instance keeps its own status. Over several instances
    /// any failed (or timed out) one fails the step, otherwise it passes.
    pub fn aggregate(instances: &[StepOutcome]) -> StepStatus {
        if let [only] = instances {
            return only.status;
        }
        if instances.iter().any(|o| o.status.is_failure()) {
            StepStatus::Failed
        } else {
            StepStatus::Passed
        }
    }

    /// First non-empty error message among instances.
    pub fn first_error(&self) -> Option<&str> {
        self.instances
            .iter()
            .map(|o| o.error_message.as_str())
            .find(|m| !m.is_empty())
    }
}

/// Result of one case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseResult {
    pub run_id: String,
    pub case_id: String,
    pub name: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub steps: Vec<StepReport>,
}
