//! Relational query boundary and result folding.

use crate::error::StepError;
use crate::model::StepContext;
use crate::retry::{RetrySpec, Retryable};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;
use thiserror::Error;

/// One result row, column name to cell.
pub type Row = Map<String, Value>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("No database connection configured for '{0}'")]
    UnknownConnection(String),
    #[error("Failed to get database connection: {0}")]
    Pool(String),
    #[error("Query failed: {0}")]
    Query(String),
    #[error("Database call was cancelled")]
    Cancelled,
}

impl Retryable for DbError {
    fn is_retryable(&self) -> bool {
        matches!(self, DbError::Pool(_))
    }

    fn cancelled() -> Self {
        DbError::Cancelled
    }
}

impl From<DbError> for StepError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::UnknownConnection(_) => StepError::Configuration(err.to_string()),
            DbError::Cancelled => StepError::Cancelled,
            other => StepError::Action(other.to_string()),
        }
    }
}

/// Executes SQL against a named connection.
#[async_trait]
pub trait RelationalClient: Send + Sync {
    async fn query(
        &self,
        connection: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, DbError>;
}

/// Database entry of an action group's `execute` list, or a `test`
/// that carries `sql`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAction {
    pub sql: String,
    #[serde(default)]
    pub db_type: Option<String>,
    /// Test-data key receiving the folded result.
    #[serde(default)]
    pub stored_key: Option<String>,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

impl DbAction {
    /// Connection name for this action in the context's region and
    /// environment, e.g. `apacuat-oracle`.
    pub fn connection_name(&self, ctx: &StepContext) -> String {
        let db_type = self.db_type.as_deref().unwrap_or("default");
        format!("{}-{}", ctx.profile(), db_type).to_lowercase()
    }
}

/// What a statement is expected to return, derived from its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlShape {
    pub is_select: bool,
    /// `LIMIT 1` / `TOP 1` / `FETCH FIRST 1 ROW`.
    pub single_row: bool,
    /// Number of selected columns, `None` for `*`.
    pub columns: Option<usize>,
}

impl SqlShape {
    pub fn parse(sql: &str) -> Self {
        static SINGLE_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"\b(limit|top)\s+1\b|\bfetch\s+first\s+1\s+rows?\b")
                .expect("failed to compile single row regex")
        });

        let text = sanitize_sql(sql);
        let is_select = text.starts_with("select") || text.starts_with("with");
        let columns = if is_select {
            select_list(&text).and_then(count_columns)
        } else {
            None
        };
        Self {
            is_select,
            single_row: is_select && SINGLE_ROW_RE.is_match(&text),
            columns,
        }
    }

    fn single_column(&self) -> bool {
        self.columns == Some(1)
    }
}

/// Lowercase, comment-free, single-spaced statement text.
pub fn sanitize_sql(sql: &str) -> String {
    static BLOCK_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)/\*.*?\*/").expect("failed to compile comment regex")
    });
    static LINE_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"--[^\n]*").expect("failed to compile comment regex")
    });

    let without_blocks = BLOCK_COMMENT_RE.replace_all(sql, " ");
    let without_lines = LINE_COMMENT_RE.replace_all(&without_blocks, " ");
    without_lines
        .to_lowercase()
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text between the outermost `select` and its `from`.
fn select_list(text: &str) -> Option<&str> {
    let start = find_top_level(text, "select ", 0)? + "select ".len();
    let end = find_top_level(text, " from ", start).unwrap_or(text.len());
    let mut list = text[start..end].trim();
    for prefix in ["distinct ", "all "] {
        if let Some(rest) = list.strip_prefix(prefix) {
            list = rest.trim_start();
        }
    }
    if let Some(rest) = list.strip_prefix("top ") {
        list = rest
            .split_once(' ')
            .map(|(_, tail)| tail.trim_start())
            .unwrap_or("");
    }
    Some(list)
}

fn find_top_level(text: &str, needle: &str, from: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quoted = false;
    for (i, ch) in text.char_indices() {
        match ch {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            _ if i >= from && depth == 0 && !quoted && text[i..].starts_with(needle) => {
                return Some(i)
            }
            _ => {}
        }
    }
    None
}

fn count_columns(list: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quoted = false;
    let mut items = vec![String::new()];
    for ch in list.chars() {
        match ch {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            ',' if depth == 0 && !quoted => {
                items.push(String::new());
                continue;
            }
            _ => {}
        }
        if let Some(last) = items.last_mut() {
            last.push(ch);
        }
    }
    if items.iter().any(|item| {
        let item = item.trim();
        item == "*" || item.ends_with(".*")
    }) {
        None
    } else {
        Some(items.len())
    }
}

/// Fold rows into the value stored for a statement of `shape`.
///
/// * no rows: `null`
/// * only null cells: `null` for a single column, `[]` otherwise
/// * single row and column: the cell
/// * single row: the row object
/// * single column: array of cells
/// * otherwise: array of row objects
///
/// Text cells holding JSON documents are decoded.
pub fn fold_rows(shape: &SqlShape, rows: Vec<Row>) -> Result<Value, StepError> {
    if rows.is_empty() {
        return Ok(Value::Null);
    }
    if shape.single_row && rows.len() > 1 {
        return Err(StepError::action(format!(
            "Invalid Match between rowNumber in SQL (1) and result ({})",
            rows.len()
        )));
    }
    if rows.iter().all(|row| row.values().all(Value::is_null)) {
        return Ok(if shape.single_column() {
            Value::Null
        } else {
            Value::Array(vec![])
        });
    }

    let rows: Vec<Row> = rows
        .into_iter()
        .map(|row| row.into_iter().map(|(k, v)| (k, decode_cell(v))).collect())
        .collect();
    let first_cell = |row: Row| row.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null);

    let folded = match (shape.single_row, shape.single_column()) {
        (true, true) => rows.into_iter().next().map(first_cell).unwrap_or(Value::Null),
        (true, false) => rows
            .into_iter()
            .next()
            .map(Value::Object)
            .unwrap_or(Value::Null),
        (false, true) => Value::Array(rows.into_iter().map(first_cell).collect()),
        (false, false) => Value::Array(rows.into_iter().map(Value::Object).collect()),
    };
    Ok(folded)
}

fn decode_cell(cell: Value) -> Value {
    match &cell {
        Value::String(text) if text.starts_with('{') || text.starts_with('[') => {
            serde_json::from_str(text).unwrap_or(cell)
        }
        _ => cell,
    }
}
