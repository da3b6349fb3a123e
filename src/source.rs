//! Variable sources behind `{{name}}` placeholders.

use crate::db::{RelationalClient, Row};
use crate::model::StepContext;
use crate::store::{StoreError, TestDataStore};
use crate::validator::get_value_by_path;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Profile tier consulted when no region/environment tier has a value.
pub const GLOBAL_PROFILE: &str = "GLOBAL";

/// Where a placeholder value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceKind {
    /// Per-case test data.
    #[default]
    Data,
    /// Global configuration key-value store.
    Config,
    /// Column of the case's scenario record.
    Scenario,
    /// Named external file.
    Xml,
    /// Variable of the `GLOBAL` profile.
    Global,
    /// Variable of the region/environment profile, falling back to
    /// `GLOBAL`.
    Component,
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Data => "Data",
            SourceKind::Config => "Config",
            SourceKind::Scenario => "Scenario",
            SourceKind::Xml => "Xml",
            SourceKind::Global => "Global",
            SourceKind::Component => "Component",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "data" | "testdata" => Ok(SourceKind::Data),
            "config" => Ok(SourceKind::Config),
            "scenario" => Ok(SourceKind::Scenario),
            "xml" | "file" => Ok(SourceKind::Xml),
            "global" => Ok(SourceKind::Global),
            "component" => Ok(SourceKind::Component),
            _ => Err(format!("Unknown sourceType '{s}'")),
        }
    }
}

impl TryFrom<String> for SourceKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceKind> for String {
    fn from(kind: SourceKind) -> Self {
        kind.name().to_string()
    }
}

/// Lookup for every source except test data.
#[async_trait]
pub trait VariableCatalog: Send + Sync {
    async fn config_value(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn scenario_column(
        &self,
        ctx: &StepContext,
        column: &str,
    ) -> Result<Option<Value>, StoreError>;

    async fn external_file(&self, name: &str) -> Result<Option<Value>, StoreError>;

    /// Variable `name` of one profile tier.
    async fn profile_variable(
        &self,
        profile: &str,
        name: &str,
    ) -> Result<Option<Value>, StoreError>;
}

/// Catalog built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticVariableCatalog {
    pub config: HashMap<String, Value>,
    /// Profile (`GLOBAL` or region+env) to variables.
    pub profiles: HashMap<String, HashMap<String, Value>>,
    pub files: HashMap<String, String>,
}

impl StaticVariableCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_profile_variable(
        mut self,
        profile: impl Into<String>,
        name: impl Into<String>,
        value: Value,
    ) -> Self {
        self.profiles
            .entry(profile.into())
            .or_default()
            .insert(name.into(), value);
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }
}

#[async_trait]
impl VariableCatalog for StaticVariableCatalog {
    async fn config_value(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.config.get(key).cloned())
    }

    async fn scenario_column(
        &self,
        ctx: &StepContext,
        column: &str,
    ) -> Result<Option<Value>, StoreError> {
        Ok(ctx.scenario.get(column).cloned())
    }

    async fn external_file(&self, name: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.files.get(name).cloned().map(Value::String))
    }

    async fn profile_variable(
        &self,
        profile: &str,
        name: &str,
    ) -> Result<Option<Value>, StoreError> {
        Ok(self
            .profiles
            .get(profile)
            .and_then(|vars| vars.get(name))
            .cloned())
    }
}

/// Catalog reading the audit, file, and variable tables.
pub struct SqlVariableCatalog {
    client: Arc<dyn RelationalClient>,
    connection: String,
    config: HashMap<String, Value>,
}

impl SqlVariableCatalog {
    pub fn new(client: Arc<dyn RelationalClient>, connection: impl Into<String>) -> Self {
        Self {
            client,
            connection: connection.into(),
            config: HashMap::new(),
        }
    }

    /// In-process configuration served by the `Config` source.
    pub fn with_config(mut self, config: HashMap<String, Value>) -> Self {
        self.config = config;
        self
    }

    async fn first_cell(&self, sql: &str, params: &[Value]) -> Result<Option<Value>, StoreError> {
        let rows: Vec<Row> = self.client.query(&self.connection, sql, params).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().map(|(_, v)| v))
            .filter(|v| !v.is_null()))
    }
}

#[async_trait]
impl VariableCatalog for SqlVariableCatalog {
    async fn config_value(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.config.get(key).cloned())
    }

    async fn scenario_column(
        &self,
        ctx: &StepContext,
        column: &str,
    ) -> Result<Option<Value>, StoreError> {
        if let Some(value) = ctx.scenario.get(column) {
            return Ok(Some(value.clone()));
        }
        let row = self
            .first_cell(
                r#"SELECT to_jsonb(a) FROM auto_case_audit a WHERE "runId" = $1 AND "caseId" = $2"#,
                &[Value::from(ctx.run_id.as_str()), Value::from(ctx.case_id.as_str())],
            )
            .await?;
        Ok(row.and_then(|row| row.get(column).cloned()))
    }

    async fn external_file(&self, name: &str) -> Result<Option<Value>, StoreError> {
        self.first_cell(
            r#"SELECT content FROM auto_case_xmlfile WHERE name = $1"#,
            &[Value::from(name)],
        )
        .await
    }

    async fn profile_variable(
        &self,
        profile: &str,
        name: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.first_cell(
            r#"SELECT "value" FROM auto_system_variable WHERE profile = $1 AND config_key = $2 LIMIT 1"#,
            &[Value::from(profile), Value::from(name)],
        )
        .await
    }
}

/// Fetches placeholder values for a step.
#[derive(Clone)]
pub struct VariableSources {
    store: Arc<dyn TestDataStore>,
    catalog: Arc<dyn VariableCatalog>,
}

impl VariableSources {
    pub fn new(store: Arc<dyn TestDataStore>, catalog: Arc<dyn VariableCatalog>) -> Self {
        Self { store, catalog }
    }

    pub fn store(&self) -> &Arc<dyn TestDataStore> {
        &self.store
    }

    /// Value of the dotted `name` from `kind`. Misses yield `null`.
    ///
    /// `overlay` is consulted first for test-data names.
    pub async fn fetch(
        &self,
        ctx: &StepContext,
        kind: SourceKind,
        name: &str,
        overlay: &Map<String, Value>,
    ) -> Result<Value, StoreError> {
        let (root, rest) = name.split_once('.').unwrap_or((name, ""));

        if kind == SourceKind::Data {
            if let Some(value) = overlay.get(root).and_then(|v| get_value_by_path(v, rest)) {
                return Ok(value.clone());
            }
            let value = self.store.get_path(&ctx.run_id, &ctx.case_id, name).await?;
            return Ok(value.unwrap_or(Value::Null));
        }

        if !rest.is_empty() {
            if let Some(value) = self.lookup(ctx, kind, name).await? {
                return Ok(decode_text(value));
            }
        }
        Ok(self
            .lookup(ctx, kind, root)
            .await?
            .map(decode_text)
            .as_ref()
            .and_then(|v| get_value_by_path(v, rest))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn lookup(
        &self,
        ctx: &StepContext,
        kind: SourceKind,
        key: &str,
    ) -> Result<Option<Value>, StoreError> {
        match kind {
            SourceKind::Data => Ok(None),
            SourceKind::Config => self.catalog.config_value(key).await,
            SourceKind::Scenario => self.catalog.scenario_column(ctx, key).await,
            SourceKind::Xml => self.catalog.external_file(key).await,
            SourceKind::Global => self.catalog.profile_variable(GLOBAL_PROFILE, key).await,
            SourceKind::Component => {
                match self.catalog.profile_variable(&ctx.profile(), key).await? {
                    Some(value) => Ok(Some(value)),
                    None => self.catalog.profile_variable(GLOBAL_PROFILE, key).await,
                }
            }
        }
    }
}

/// Text holding a JSON document is traversed as that document.
fn decode_text(value: Value) -> Value {
    if let Value::String(text) = &value {
        if text.starts_with('{') || text.starts_with('[') {
            if let Ok(parsed) = serde_json::from_str(text) {
                return parsed;
            }
        }
    }
    value
}
