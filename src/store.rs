//! Per-case test data.
//!
//! Steps read and write a JSON document keyed by run and case. The
//! in-memory store backs debug runs and tests; [`SqlTestDataStore`]
//! keeps the document in the case audit table.

use crate::db::{DbError, RelationalClient, Row};
use crate::validator::get_value_by_path;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Key under which step statuses are recorded.
pub const STATUS_TRACK_KEY: &str = "testDataTrack";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] DbError),
    #[error("Test data store error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait TestDataStore: Send + Sync {
    /// Whole test-data document of a case; empty when absent.
    async fn get(&self, run_id: &str, case_id: &str) -> Result<Map<String, Value>, StoreError>;

    /// Value at a dotted path, `None` when any segment is missing.
    async fn get_path(
        &self,
        run_id: &str,
        case_id: &str,
        path: &str,
    ) -> Result<Option<Value>, StoreError>;

    /// Set a top-level key, last writer wins.
    async fn merge(
        &self,
        run_id: &str,
        case_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), StoreError>;

    /// Record the final status of a logical step.
    async fn record_step_status(
        &self,
        run_id: &str,
        case_id: &str,
        step_id: u64,
        status: &str,
    ) -> Result<(), StoreError>;
}

/// Test data held in process memory.
#[derive(Debug, Default)]
pub struct MemoryTestDataStore {
    documents: RwLock<HashMap<(String, String), Map<String, Value>>>,
}

impl MemoryTestDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with one case document.
    pub fn seeded(run_id: &str, case_id: &str, data: Map<String, Value>) -> Self {
        let mut documents = HashMap::new();
        documents.insert((run_id.to_string(), case_id.to_string()), data);
        Self {
            documents: RwLock::new(documents),
        }
    }

    fn key(run_id: &str, case_id: &str) -> (String, String) {
        (run_id.to_string(), case_id.to_string())
    }
}

#[async_trait]
impl TestDataStore for MemoryTestDataStore {
    async fn get(&self, run_id: &str, case_id: &str) -> Result<Map<String, Value>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .get(&Self::key(run_id, case_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_path(
        &self,
        run_id: &str,
        case_id: &str,
        path: &str,
    ) -> Result<Option<Value>, StoreError> {
        let documents = self.documents.read().await;
        let Some(document) = documents.get(&Self::key(run_id, case_id)) else {
            return Ok(None);
        };
        let (root, rest) = path.split_once('.').unwrap_or((path, ""));
        Ok(document
            .get(root)
            .and_then(|value| get_value_by_path(value, rest))
            .cloned())
    }

    async fn merge(
        &self,
        run_id: &str,
        case_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        documents
            .entry(Self::key(run_id, case_id))
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn record_step_status(
        &self,
        run_id: &str,
        case_id: &str,
        step_id: u64,
        status: &str,
    ) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        let document = documents.entry(Self::key(run_id, case_id)).or_default();
        let track = document
            .entry(STATUS_TRACK_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if !track.is_object() {
            *track = Value::Object(Map::new());
        }
        if let Value::Object(track) = track {
            track.insert(step_id.to_string(), Value::String(status.to_string()));
        }
        Ok(())
    }
}

/// Test data persisted in the `testData` column of `auto_case_audit`.
pub struct SqlTestDataStore {
    client: Arc<dyn RelationalClient>,
    connection: String,
}

impl SqlTestDataStore {
    pub fn new(client: Arc<dyn RelationalClient>, connection: impl Into<String>) -> Self {
        Self {
            client,
            connection: connection.into(),
        }
    }

    async fn single_value(&self, sql: &str, params: &[Value]) -> Result<Option<Value>, StoreError> {
        let rows: Vec<Row> = self.client.query(&self.connection, sql, params).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().map(|(_, v)| v))
            .filter(|v| !v.is_null()))
    }
}

#[async_trait]
impl TestDataStore for SqlTestDataStore {
    async fn get(&self, run_id: &str, case_id: &str) -> Result<Map<String, Value>, StoreError> {
        let value = self
            .single_value(
                r#"SELECT "testData" FROM auto_case_audit WHERE "runId" = $1 AND "caseId" = $2"#,
                &[Value::from(run_id), Value::from(case_id)],
            )
            .await?;
        match value {
            Some(Value::Object(map)) => Ok(map),
            Some(other) => Err(StoreError::Backend(format!(
                "testData of case {case_id} is not an object: {other}"
            ))),
            None => Ok(Map::new()),
        }
    }

    async fn get_path(
        &self,
        run_id: &str,
        case_id: &str,
        path: &str,
    ) -> Result<Option<Value>, StoreError> {
        debug!(run_id, case_id, path, "Reading persisted test data");
        self.single_value(
            r#"SELECT "testData" #> string_to_array($3, '.') FROM auto_case_audit WHERE "runId" = $1 AND "caseId" = $2"#,
            &[Value::from(run_id), Value::from(case_id), Value::from(path)],
        )
        .await
    }

    async fn merge(
        &self,
        run_id: &str,
        case_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        self.client
            .query(
                &self.connection,
                r#"UPDATE auto_case_audit SET "testData" = jsonb_set(COALESCE("testData", '{}'::jsonb), ARRAY[$3::text], $4::text::jsonb, true) WHERE "runId" = $1 AND "caseId" = $2"#,
                &[
                    Value::from(run_id),
                    Value::from(case_id),
                    Value::from(key),
                    Value::String(value.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn record_step_status(
        &self,
        run_id: &str,
        case_id: &str,
        step_id: u64,
        status: &str,
    ) -> Result<(), StoreError> {
        self.client
            .query(
                &self.connection,
                r#"UPDATE auto_case_audit SET "testDataTrack" = COALESCE("testDataTrack", '{}'::jsonb) || jsonb_build_object($3::text, $4::text) WHERE "runId" = $1 AND "caseId" = $2"#,
                &[
                    Value::from(run_id),
                    Value::from(case_id),
                    Value::from(step_id.to_string()),
                    Value::from(status),
                ],
            )
            .await?;
        Ok(())
    }
}
