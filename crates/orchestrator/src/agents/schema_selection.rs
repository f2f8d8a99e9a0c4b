//! Schema selection: LLM term extraction, then parallel store fan-out
//! with deduplication. Does not generate SQL.

use crate::agents::{agent_message, AgentContext, SqlAgent};
use crate::prompts::{self, PromptContext};
use async_trait::async_trait;
use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sql_agent_common::llm::LlmClient;
use sql_agent_common::{AgentName, Message, Result};
use sql_agent_retrieval::{ColumnValueRecord, EntitySchema};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Entities retrieved per search group.
const SCHEMAS_PER_GROUP: usize = 3;
/// Column values retrieved per filter term.
const VALUES_PER_FILTER: usize = 5;

/// The LLM's intermediate extraction.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TermExtraction {
    /// Groups of key terms, one group per candidate entity.
    pub entities: Vec<Vec<String>>,
    /// Literal filter values worth resolving against the column value
    /// store.
    pub filter_conditions: Vec<String>,
}

/// The agent's thread message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSelectionOutput {
    pub schema_options: Vec<EntitySchema>,
    pub column_values: Vec<ColumnValueRecord>,
    /// A filter term matched columns on more than one (entity, column)
    /// pair; the disambiguation agent must weigh in.
    pub ambiguity_detected: bool,
}

pub struct SchemaSelectionAgent {
    llm: Arc<LlmClient>,
}

impl SchemaSelectionAgent {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl SqlAgent for SchemaSelectionAgent {
    fn name(&self) -> AgentName {
        AgentName::SchemaSelection
    }

    #[instrument(skip_all, fields(question = %context.question))]
    async fn run(&self, context: &AgentContext) -> Result<Message> {
        let system = prompts::render(
            "schema_selection_agent",
            &PromptContext::from_config(&context.config, context.run_started),
        )?;
        let (extraction, usage) = self
            .llm
            .structured::<TermExtraction>(&system, &context.question)
            .await?;
        debug!(?extraction, "Extracted search terms");

        let entity_queries: Vec<String> = extraction.entities.iter().map(|group| group.join(" ")).collect();
        let schema_lookups = entity_queries
            .iter()
            .map(|query| context.tools.get_entity_schemas(query, SCHEMAS_PER_GROUP, &[]));
        let schema_results = join_all(schema_lookups).await;

        let mut schema_options: Vec<EntitySchema> = Vec::new();
        let mut seen = HashSet::new();
        for result in schema_results {
            match result {
                Ok(schemas) => {
                    for schema in schemas {
                        if seen.insert(schema.fqn.clone()) {
                            schema_options.push(schema);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Entity lookup failed"),
            }
        }

        let mut column_values: Vec<ColumnValueRecord> = Vec::new();
        let mut ambiguity_detected = false;
        if context.config.use_column_value_store {
            let value_lookups = extraction
                .filter_conditions
                .iter()
                .map(|term| context.tools.get_column_values(term, VALUES_PER_FILTER));
            for (term, result) in extraction.filter_conditions.iter().zip(join_all(value_lookups).await) {
                match result {
                    Ok(values) => {
                        let distinct_columns: HashSet<(String, String)> = values
                            .iter()
                            .map(|v| (v.entity.clone(), v.column.clone()))
                            .collect();
                        if distinct_columns.len() > 1 {
                            debug!(term, candidates = distinct_columns.len(), "Filter term is ambiguous");
                            ambiguity_detected = true;
                        }
                        column_values.extend(values);
                    }
                    Err(e) => warn!(error = %e, term, "Column value lookup failed"),
                }
            }
        }

        let output = SchemaSelectionOutput {
            schema_options,
            column_values,
            ambiguity_detected,
        };
        agent_message(self.name(), &output, usage)
    }
}
