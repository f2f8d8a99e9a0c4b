//! Typed tool registry shared by the agents.
//!
//! Every tool call runs under the per-call timeout; transient failures
//! are retried up to three times with backoff and unchanged arguments.
//! `execute_sql` is the only tool with an observable side effect.

use chrono::{DateTime, SecondsFormat, Utc};
use sql_agent_common::{QueryResult, Result, Text2SqlConfig, Text2SqlError};
use sql_agent_connectors::validator::ValidationOutcome;
use sql_agent_connectors::{validate_select, SqlConnector};
use sql_agent_retrieval::{CacheEntry, CacheHit, ColumnValueRecord, ColumnValueStore, EntitySchema, QueryCache, SchemaStore};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const MAX_TOOL_ATTEMPTS: usize = 3;
const BACKOFF_BASE_MS: u64 = 200;

pub struct ToolRegistry {
    schema_store: Arc<SchemaStore>,
    column_value_store: Option<Arc<ColumnValueStore>>,
    query_cache: Option<Arc<QueryCache>>,
    connector: Arc<dyn SqlConnector>,
    tool_timeout: Duration,
    row_limit: usize,
}

impl ToolRegistry {
    pub fn new(
        config: &Text2SqlConfig,
        schema_store: Arc<SchemaStore>,
        column_value_store: Option<Arc<ColumnValueStore>>,
        query_cache: Option<Arc<QueryCache>>,
        connector: Arc<dyn SqlConnector>,
    ) -> Self {
        Self {
            schema_store,
            column_value_store,
            query_cache,
            connector,
            tool_timeout: Duration::from_secs(config.tool_timeout_seconds),
            row_limit: config.row_limit,
        }
    }

    pub fn row_limit(&self) -> usize {
        self.row_limit
    }

    /// Deterministic per run: callers pass the timestamp captured at run
    /// start.
    pub fn current_datetime(run_started: DateTime<Utc>) -> String {
        run_started.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Hybrid search for entity schemas, excluding entities already held.
    #[instrument(skip(self, excluded_entities))]
    pub async fn get_entity_schemas(
        &self,
        search_text: &str,
        n: usize,
        excluded_entities: &[String],
    ) -> Result<Vec<EntitySchema>> {
        self.with_retry("get_entity_schemas", || {
            self.schema_store.get_entity_schemas(search_text, n, excluded_entities)
        })
        .await
    }

    /// Concrete column values for a free-text filter term. Empty when the
    /// column value store is disabled.
    #[instrument(skip(self))]
    pub async fn get_column_values(&self, search_text: &str, n: usize) -> Result<Vec<ColumnValueRecord>> {
        let Some(store) = &self.column_value_store else {
            return Ok(vec![]);
        };
        self.with_retry("get_column_values", || store.get_column_values(search_text, n))
            .await
    }

    /// Dialect-aware parse check. Purely in-process, no timeout needed.
    pub fn validate_sql(&self, sql: &str) -> ValidationOutcome {
        validate_select(sql, self.schema_store.engine())
    }

    /// Single-shot read-only SELECT under the configured row cap.
    #[instrument(skip(self))]
    pub async fn execute_sql(&self, sql: &str) -> Result<QueryResult> {
        let limit = self.row_limit;
        self.with_retry("execute_sql", || self.connector.execute(sql, limit))
            .await
    }

    /// Question-similarity cache lookup with the template rendered.
    pub async fn cache_lookup(
        &self,
        question: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<Option<CacheHit>> {
        let Some(cache) = &self.query_cache else {
            return Ok(None);
        };
        self.with_retry("cache_lookup", || cache.lookup(question, parameters))
            .await
    }

    /// Write-through after a successful run. Failures are surfaced for
    /// logging but never fail the run.
    pub async fn cache_write(&self, entry: CacheEntry) -> Result<()> {
        let Some(cache) = &self.query_cache else {
            return Ok(());
        };
        cache.write(entry).await
    }

    async fn with_retry<T, F, Fut>(&self, tool: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for attempt in 0..MAX_TOOL_ATTEMPTS {
            if attempt > 0 {
                let backoff = Duration::from_millis(BACKOFF_BASE_MS * (1 << attempt));
                debug!(tool, attempt, ?backoff, "Retrying tool call");
                tokio::time::sleep(backoff).await;
            }

            match tokio::time::timeout(self.tool_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_retriable() => {
                    warn!(tool, attempt, error = %e, "Tool call failed");
                    last_error = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(tool, attempt, "Tool call timed out");
                    last_error = Some(Text2SqlError::ToolTimeout {
                        tool: tool.to_string(),
                        seconds: self.tool_timeout.as_secs(),
                    });
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Text2SqlError::ToolTimeout {
            tool: tool.to_string(),
            seconds: self.tool_timeout.as_secs(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn current_datetime_is_iso8601() {
        let instant = Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap();
        assert_eq!(ToolRegistry::current_datetime(instant), "2024-06-01T09:30:00Z");
    }
}
