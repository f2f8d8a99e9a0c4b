use crate::types::{DatabaseEngine, HARD_ROW_CAP};
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// When a successful run writes its generated SQL back to the query cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheWriteStrategy {
    /// Write on every successful run.
    #[default]
    Always,
    Never,
    /// Only write once the caller reports positive feedback.
    PositiveFeedbackOnly,
    /// Collect entries for an offline ingestion batch instead of writing live.
    OfflineBatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub host: String,
    pub port: u16,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".to_string(),
            port: 11434,
            model: "qwen2.5-coder:14b".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub qdrant_url: String,
    pub schema_store_collection: String,
    pub column_value_collection: String,
    pub query_cache_collection: String,
    pub vector_size: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            qdrant_url: "http://localhost:6334".to_string(),
            schema_store_collection: "text2sql-schema-store".to_string(),
            column_value_collection: "text2sql-column-value-store".to_string(),
            query_cache_collection: "text2sql-query-cache".to_string(),
            vector_size: 384,
        }
    }
}

/// Per-engine connection parameters. Only the block matching
/// `target_engine` is consulted at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub sqlite: Option<SqliteConnection>,
    #[serde(default)]
    pub postgres: Option<PostgresConnection>,
    #[serde(default)]
    pub tsql: Option<TsqlConnection>,
    #[serde(default)]
    pub snowflake: Option<SnowflakeConnection>,
    #[serde(default)]
    pub databricks: Option<DatabricksConnection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConnection {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConnection {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsqlConnection {
    pub host: String,
    #[serde(default = "default_tsql_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub trust_certificate: bool,
}

fn default_tsql_port() -> u16 {
    1433
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnowflakeConnection {
    pub account: String,
    pub warehouse: String,
    pub database: String,
    pub schema: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabricksConnection {
    pub host: String,
    pub http_path: String,
    pub catalog: String,
    pub schema: String,
    pub token: String,
}

/// Process-wide configuration for the Text2SQL pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Text2SqlConfig {
    /// Short description of the database's business domain, injected into
    /// agent prompts.
    pub use_case: String,
    pub target_engine: DatabaseEngine,
    /// Free-text prompt fragment appended to generation/correction prompts.
    #[serde(default)]
    pub engine_specific_rules: String,
    #[serde(default = "default_row_limit")]
    pub row_limit: usize,
    #[serde(default = "default_true")]
    pub use_query_cache: bool,
    #[serde(default = "default_true")]
    pub pre_run_query_cache: bool,
    #[serde(default = "default_true")]
    pub use_column_value_store: bool,
    #[serde(default)]
    pub generate_follow_up_suggestions: bool,
    /// Stream per-agent `Thought` payloads for diagnostics.
    #[serde(default)]
    pub emit_thoughts: bool,
    #[serde(default = "default_cache_hit_threshold")]
    pub cache_hit_threshold: f32,
    #[serde(default)]
    pub cache_write_strategy: CacheWriteStrategy,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_parallel")]
    pub max_parallel_subquestions: usize,
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_seconds: u64,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

fn default_row_limit() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_cache_hit_threshold() -> f32 {
    0.85
}

fn default_max_messages() -> usize {
    20
}

fn default_max_parallel() -> usize {
    4
}

fn default_run_timeout() -> u64 {
    300
}

fn default_tool_timeout() -> u64 {
    60
}

impl Default for Text2SqlConfig {
    fn default() -> Self {
        Self {
            use_case: "a relational analytics database".to_string(),
            target_engine: DatabaseEngine::Sqlite,
            engine_specific_rules: String::new(),
            row_limit: default_row_limit(),
            use_query_cache: true,
            pre_run_query_cache: true,
            use_column_value_store: true,
            generate_follow_up_suggestions: false,
            emit_thoughts: false,
            cache_hit_threshold: default_cache_hit_threshold(),
            cache_write_strategy: CacheWriteStrategy::default(),
            max_messages: default_max_messages(),
            max_parallel_subquestions: default_max_parallel(),
            run_timeout_seconds: default_run_timeout(),
            tool_timeout_seconds: default_tool_timeout(),
            llm: LlmConfig::default(),
            search: SearchConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl Text2SqlConfig {
    /// Load from a YAML file and validate.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;
        let config: Self = serde_yaml::from_str(&raw).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TEXT2SQL__*` environment overrides to the feature switches.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(v) = env_bool("TEXT2SQL__USE_QUERY_CACHE") {
            self.use_query_cache = v;
        }
        if let Some(v) = env_bool("TEXT2SQL__PRE_RUN_QUERY_CACHE") {
            self.pre_run_query_cache = v;
        }
        if let Some(v) = env_bool("TEXT2SQL__USE_COLUMN_VALUE_STORE") {
            self.use_column_value_store = v;
        }
        if let Ok(engine) = std::env::var("TEXT2SQL__DATABASE_ENGINE") {
            match engine.parse() {
                Ok(parsed) => self.target_engine = parsed,
                Err(_) => warn!("Unrecognised TEXT2SQL__DATABASE_ENGINE value: {engine}"),
            }
        }
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.row_limit == 0 {
            return Err(anyhow!("row_limit must be at least 1"));
        }
        if self.row_limit > HARD_ROW_CAP {
            return Err(anyhow!("row_limit must not exceed the hard cap of {HARD_ROW_CAP}"));
        }
        if !(0.0..=1.0).contains(&self.cache_hit_threshold) {
            return Err(anyhow!("cache_hit_threshold must be within [0, 1]"));
        }
        if self.max_messages < 2 {
            return Err(anyhow!("max_messages must allow at least one agent reply"));
        }
        if self.max_parallel_subquestions == 0 {
            return Err(anyhow!("max_parallel_subquestions must be at least 1"));
        }
        if self.connection_missing() {
            warn!(
                "No connection parameters configured for target engine {}",
                self.target_engine
            );
        }
        Ok(())
    }

    fn connection_missing(&self) -> bool {
        match self.target_engine {
            DatabaseEngine::Sqlite => self.connection.sqlite.is_none(),
            DatabaseEngine::Postgres => self.connection.postgres.is_none(),
            DatabaseEngine::Tsql => self.connection.tsql.is_none(),
            DatabaseEngine::Snowflake => self.connection.snowflake.is_none(),
            DatabaseEngine::Databricks => self.connection.databricks.is_none(),
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v.to_lowercase() == "true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Text2SqlConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_row_limit_is_rejected() {
        let config = Text2SqlConfig {
            row_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn row_limit_above_hard_cap_is_rejected() {
        let config = Text2SqlConfig {
            row_limit: HARD_ROW_CAP + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let config = Text2SqlConfig {
            cache_hit_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
