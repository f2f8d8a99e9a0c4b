use crate::sql::{effective_limit, ensure_select, SqlConnector};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use sql_agent_common::{DatabaseEngine, QueryResult, Result, Text2SqlError};
use tracing::{info, instrument};

pub struct PostgresConnector {
    pool: PgPool,
}

impl PostgresConnector {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new().max_connections(4).connect(url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SqlConnector for PostgresConnector {
    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::Postgres
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

fn decode_row(row: &PgRow) -> Vec<serde_json::Value> {
    (0..row.columns().len()).map(|i| decode_value(row, i)).collect()
}

fn decode_value(row: &PgRow, index: usize) -> serde_json::Value {
    if let Ok(raw) = row.try_get_raw(index) {
        if raw.is_null() {
            return serde_json::Value::Null;
        }
    }

    let type_name = row.columns()[index].type_info().name().to_uppercase();
    match type_name.as_str() {
        "INT2" => row
            .try_get::<i16, _>(index)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "INT4" => row
            .try_get::<i32, _>(index)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "INT8" => row
            .try_get::<i64, _>(index)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "FLOAT4" => row
            .try_get::<f32, _>(index)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "FLOAT8" => row
            .try_get::<f64, _>(index)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "BOOL" => row
            .try_get::<bool, _>(index)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<DateTime<Utc>, _>(index)
            .map(|v| serde_json::Value::from(v.to_rfc3339()))
            .unwrap_or(serde_json::Value::Null),
        "TIMESTAMP" => row
            .try_get::<NaiveDateTime, _>(index)
            .map(|v| serde_json::Value::from(v.to_string()))
            .unwrap_or(serde_json::Value::Null),
        "DATE" => row
            .try_get::<NaiveDate, _>(index)
            .map(|v| serde_json::Value::from(v.to_string()))
            .unwrap_or(serde_json::Value::Null),
        "TIME" => row
            .try_get::<NaiveTime, _>(index)
            .map(|v| serde_json::Value::from(v.to_string()))
            .unwrap_or(serde_json::Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<serde_json::Value, _>(index)
            .unwrap_or(serde_json::Value::Null),
        // NUMERIC and anything exotic: fall back to text, then null.
        _ => row
            .try_get::<String, _>(index)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
    }
}
