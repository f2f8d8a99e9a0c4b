//! The SQL execution contract and the per-engine connector factory.

use crate::validator::validate_select;
use async_trait::async_trait;
use sql_agent_common::{
    DatabaseEngine, QueryResult, Result, Text2SqlConfig, Text2SqlError, HARD_ROW_CAP,
};
use std::sync::Arc;

/// A table or view surfaced by catalog introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub schema: String,
    pub name: String,
}

/// Executes a single read-only SELECT with a row cap.
#[async_trait]
pub trait SqlConnector: Send + Sync {
    fn engine(&self) -> DatabaseEngine;

    /// Run `sql`, fetching at most `row_limit` rows (clamped to the hard
    /// cap). Implementations fetch one extra row to set `truncated`.
    async fn execute(&self, sql: &str, row_limit: usize) -> Result<QueryResult>;

    /// Enumerate the queryable tables and views, via each engine's
    /// catalog.
    async fn list_entities(&self) -> Result<Vec<EntityRef>> {
        let sql = match self.engine() {
            DatabaseEngine::Sqlite => {
                "SELECT '' AS table_schema, name AS table_name FROM sqlite_master \
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name"
            }
            DatabaseEngine::Postgres => {
                "SELECT table_schema, table_name FROM information_schema.tables \
                 WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
                 ORDER BY table_schema, table_name"
            }
            // TSQL, Snowflake and Databricks all expose the standard
            // information schema.
            _ => {
                "SELECT table_schema, table_name FROM information_schema.tables \
                 WHERE table_schema <> 'INFORMATION_SCHEMA' ORDER BY table_schema, table_name"
            }
        };

        let result = self.execute(sql, HARD_ROW_CAP).await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| {
                let schema = row.first()?.as_str().unwrap_or_default().to_string();
                let name = row.get(1)?.as_str()?.to_string();
                Some(EntityRef { schema, name })
            })
            .collect())
    }

    /// Distinct values of one column, for column-value store builds and
    /// sample values in entity documents.
    async fn sample_column_values(
        &self,
        entity: &str,
        column: &str,
        n: usize,
    ) -> Result<Vec<serde_json::Value>> {
        let limit = effective_limit(n);
        let sql = match self.engine() {
            DatabaseEngine::Tsql => {
                format!("SELECT DISTINCT TOP {limit} {column} FROM {entity} WHERE {column} IS NOT NULL")
            }
            _ => format!(
                "SELECT DISTINCT {column} FROM {entity} WHERE {column} IS NOT NULL LIMIT {limit}"
            ),
        };
        let result = self.execute(&sql, limit).await?;
        Ok(result.rows.into_iter().filter_map(|row| row.into_iter().next()).collect())
    }
}

/// Clamp the caller's limit to the hard cap.
pub(crate) fn effective_limit(row_limit: usize) -> usize {
    row_limit.clamp(1, HARD_ROW_CAP)
}

/// Reject anything that is not a single SELECT before it reaches the
/// database.
pub(crate) fn ensure_select(sql: &str, engine: DatabaseEngine) -> Result<()> {
    let outcome = validate_select(sql, engine);
    if !outcome.ok {
        return Err(Text2SqlError::SqlSyntax(outcome.errors.join("; ")));
    }
    Ok(())
}

/// Build the connector for the configured target engine.
pub async fn create_connector(config: &Text2SqlConfig) -> anyhow::Result<Arc<dyn SqlConnector>> {
    match config.target_engine {
        DatabaseEngine::Sqlite => {
            let connection = config
                .connection
                .sqlite
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("sqlite connection parameters missing"))?;
            Ok(Arc::new(crate::sqlite::SqliteConnector::connect(&connection.path).await?))
        }
        DatabaseEngine::Postgres => {
            let connection = config
                .connection
                .postgres
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("postgres connection parameters missing"))?;
            Ok(Arc::new(crate::postgres::PostgresConnector::connect(&connection.url).await?))
        }
        DatabaseEngine::Tsql => {
            let connection = config
                .connection
                .tsql
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("tsql connection parameters missing"))?;
            Ok(Arc::new(crate::tsql::TsqlConnector::new(connection.clone())))
        }
        DatabaseEngine::Snowflake => {
            let connection = config
                .connection
                .snowflake
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("snowflake connection parameters missing"))?;
            Ok(Arc::new(crate::snowflake::SnowflakeConnector::new(connection.clone())))
        }
        DatabaseEngine::Databricks => {
            let connection = config
                .connection
                .databricks
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("databricks connection parameters missing"))?;
            Ok(Arc::new(crate::databricks::DatabricksConnector::new(connection.clone())?))
        }
    }
}
