//! PostgreSQL implementation of [`RelationalClient`].

use crate::db::{DbError, RelationalClient, Row};
use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, Runtime};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use tracing::debug;

/// Named connections backed by lazily created pools.
pub struct PgRelationalClient {
    /// Connection name to connection URL.
    urls: HashMap<String, String>,
    /// URL used for names missing from `urls`.
    fallback_url: Option<String>,
    pools: RwLock<HashMap<String, Pool>>,
}

impl PgRelationalClient {
    pub fn new(urls: HashMap<String, String>) -> Self {
        Self {
            urls: urls
                .into_iter()
                .map(|(name, url)| (name.to_lowercase(), url))
                .collect(),
            fallback_url: None,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_fallback_url(mut self, url: impl Into<String>) -> Self {
        self.fallback_url = Some(url.into());
        self
    }

    fn url_for(&self, connection: &str) -> Result<&str, DbError> {
        self.urls
            .get(&connection.to_lowercase())
            .or(self.fallback_url.as_ref())
            .map(String::as_str)
            .ok_or_else(|| DbError::UnknownConnection(connection.to_string()))
    }

    async fn pool(&self, connection: &str) -> Result<Pool, DbError> {
        let url = self.url_for(connection)?;
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(url) {
                return Ok(pool.clone());
            }
        }

        let mut config = Config::new();
        config.url = Some(url.to_string());
        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DbError::Pool(format!("failed to create pool: {e}")))?;

        let mut pools = self.pools.write().await;
        Ok(pools.entry(url.to_string()).or_insert(pool).clone())
    }
}

#[async_trait]
impl RelationalClient for PgRelationalClient {
    async fn query(
        &self,
        connection: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, DbError> {
        let pool = self.pool(connection).await?;
        let client = pool.get().await.map_err(|e| DbError::Pool(e.to_string()))?;

        let pg_params: Vec<Box<dyn ToSql + Sync + Send>> =
            params.iter().map(json_to_pg_param).collect();
        let param_refs: Vec<&(dyn ToSql + Sync)> = pg_params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        debug!(connection, "Executing SQL: {}", sql);
        let rows = client
            .query(sql, &param_refs)
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| {
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, column)| (column.name().to_string(), pg_value_to_json(row, i)))
                    .collect()
            })
            .collect())
    }
}

fn json_to_pg_param(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Box::new(i)
            } else if let Some(f) = n.as_f64() {
                Box::new(f)
            } else {
                Box::new(n.to_string())
            }
        }
        Value::String(s) => Box::new(s.clone()),
        other => Box::new(other.to_string()),
    }
}

fn pg_value_to_json(row: &tokio_postgres::Row, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<_, Option<i64>>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<i32>>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<i16>>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<f64>>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<f32>>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<bool>>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<String>>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<Value>>(idx) {
        return v.unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx) {
        return v.map(|dt| Value::from(dt.to_rfc3339())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<chrono::NaiveDateTime>>(idx) {
        return v
            .map(|dt| Value::from(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<chrono::NaiveDate>>(idx) {
        return v.map(|d| Value::from(d.to_string())).unwrap_or(Value::Null);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_lookup_is_case_insensitive() {
        let mut urls = HashMap::new();
        urls.insert("APACUAT-default".to_string(), "postgres://a/db".to_string());
        let client = PgRelationalClient::new(urls);
        assert_eq!(client.url_for("apacuat-DEFAULT").unwrap(), "postgres://a/db");
        assert!(matches!(
            client.url_for("emeauat-default"),
            Err(DbError::UnknownConnection(_))
        ));

        let client = client.with_fallback_url("postgres://fallback/db");
        assert_eq!(client.url_for("emeauat-default").unwrap(), "postgres://fallback/db");
    }
}
