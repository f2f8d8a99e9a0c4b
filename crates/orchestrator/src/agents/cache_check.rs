//! Deterministic cache agent: question-similarity lookup with optional
//! pre-run hydration. No LLM involved.

use crate::agents::{agent_message, AgentContext, SqlAgent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sql_agent_common::{AgentName, Message, QueryResult, Result};
use sql_agent_retrieval::EntitySchema;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheCheckOutput {
    pub cache_hit: bool,
    /// Rows were refreshed by executing the rendered SQL just now.
    pub pre_run_results: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default)]
    pub schemas: Vec<EntitySchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<QueryResult>,
}

#[derive(Default)]
pub struct CacheCheckAgent;

impl CacheCheckAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SqlAgent for CacheCheckAgent {
    fn name(&self) -> AgentName {
        AgentName::QueryCache
    }

    #[instrument(skip_all, fields(question = %context.question))]
    async fn run(&self, context: &AgentContext) -> Result<Message> {
        let lookup = context
            .tools
            .cache_lookup(&context.question, &context.injected_parameters)
            .await?;

        let output = match lookup {
            None => CacheCheckOutput::default(),
            Some(hit) => {
                let mut output = CacheCheckOutput {
                    cache_hit: true,
                    pre_run_results: false,
                    cached_question: Some(hit.question),
                    sql: Some(hit.sql.clone()),
                    schemas: hit.schemas,
                    rows: None,
                };
                if context.config.pre_run_query_cache {
                    // Rows are refreshed, never served stale; an execution
                    // failure demotes the hit to "no pre-run".
                    match context.tools.execute_sql(&hit.sql).await {
                        Ok(rows) => {
                            info!("Cache hit hydrated with fresh rows");
                            output.pre_run_results = true;
                            output.rows = Some(rows);
                        }
                        Err(e) => {
                            warn!(error = %e, "Pre-run of cached SQL failed; demoting hit");
                        }
                    }
                }
                output
            }
        };

        agent_message(self.name(), &output, None)
    }
}
