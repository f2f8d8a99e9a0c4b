use crate::sql::{effective_limit, ensure_select, SqlConnector};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use sql_agent_common::{DatabaseEngine, QueryResult, Result, Text2SqlError};
use tracing::{info, instrument};

pub struct SqliteConnector {
    pool: SqlitePool,
}

impl SqliteConnector {
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SqlConnector for SqliteConnector {
    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::Sqlite
    }

    #[instrument(skip(self))]
    async fn execute(&self, sql: &str, row_limit: usize) -> Result<QueryResult> {
        ensure_select(sql, self.engine())?;
        let limit = effective_limit(row_limit);
        info!(limit, "Running query");

        let mut stream = sqlx::query(sql).fetch(&self.pool);
        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<serde_json::Value>> = Vec::new();
        let mut truncated = false;

        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| Text2SqlError::SqlExecution(e.to_string()))?
        {
            if columns.is_empty() {
                columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            if rows.len() == limit {
                truncated = true;
                break;
            }
            rows.push(decode_row(&row));
        }

        Ok(QueryResult {
            columns,
            rows,
            truncated,
        })
    }
}

fn decode_row(row: &SqliteRow) -> Vec<serde_json::Value> {
    (0..row.columns().len()).map(|i| decode_value(row, i)).collect()
}

fn decode_value(row: &SqliteRow, index: usize) -> serde_json::Value {
    if let Ok(raw) = row.try_get_raw(index) {
        if raw.is_null() {
            return serde_json::Value::Null;
        }
    }

    let type_name = row.columns()[index].type_info().name().to_uppercase();
    match type_name.as_str() {
        "INTEGER" | "INT" | "BIGINT" => row
            .try_get::<i64, _>(index)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => row
            .try_get::<f64, _>(index)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "BOOLEAN" => row
            .try_get::<bool, _>(index)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        _ => row
            .try_get::<String, _>(index)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
    }
}
