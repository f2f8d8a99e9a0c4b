//! SQL generation: one SELECT per invocation, validated before it leaves
//! the agent. The model either returns SQL or requests more context
//! through the tool loop.

use crate::agents::{agent_message, collected_schemas, last_json_from, AgentContext, SqlAgent};
use crate::prompts::{self, PromptContext};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sql_agent_common::llm::LlmClient;
use sql_agent_common::{AgentName, Message, Result, TokenUsage};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Parse-failure self-corrections before handing off to correction.
const VALIDATION_RETRIES: usize = 2;
/// Tool-request rounds before the model must commit to an answer.
const MAX_TOOL_ROUNDS: usize = 3;

/// One tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolRequest {
    /// `get_entity_schemas` or `get_column_values`.
    pub tool: String,
    pub search_text: String,
}

/// The model's raw step output: either SQL, tool requests, or an error.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GenerationDraft {
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub tool_requests: Vec<ToolRequest>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The agent's thread message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct GenerationAgent {
    llm: Arc<LlmClient>,
}

impl GenerationAgent {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    fn build_user_content(context: &AgentContext, extra_context: &[serde_json::Value]) -> String {
        let schemas = collected_schemas(&context.thread);
        let selection = last_json_from(&context.thread, AgentName::SchemaSelection);
        let disambiguation = last_json_from(&context.thread, AgentName::Disambiguation);
        let cache = last_json_from(&context.thread, AgentName::QueryCache);

        let cached_guidance = cache.as_ref().and_then(|c| {
            if c.get("cache_hit").and_then(|v| v.as_bool()).unwrap_or(false) {
                c.get("sql").cloned()
            } else {
                None
            }
        });

        json!({
            "question": context.question,
            "schemas": schemas,
            "column_values": selection
                .as_ref()
                .and_then(|s| s.get("column_values").cloned())
                .unwrap_or_else(|| json!([])),
            "disambiguation": disambiguation,
            "cached_similar_query": cached_guidance,
            "earlier_results": context.prior_sources,
            "additional_context": extra_context,
        })
        .to_string()
    }
}

#[async_trait]
impl SqlAgent for GenerationAgent {
    fn name(&self) -> AgentName {
        AgentName::Generation
    }

    #[instrument(skip_all, fields(question = %context.question))]
    async fn run(&self, context: &AgentContext) -> Result<Message> {
        let system = prompts::render(
            "sql_generation_agent",
            &PromptContext::from_config(&context.config, context.run_started),
        )?;

        let mut extra_context: Vec<serde_json::Value> = Vec::new();
        let mut total_usage = TokenUsage::default();
        let mut validation_failures = 0usize;
        let mut last_sql: Option<String> = None;
        let mut tool_rounds = 0usize;

        loop {
            let user = Self::build_user_content(context, &extra_context);
            let (draft, usage) = self.llm.structured::<GenerationDraft>(&system, &user).await?;
            if let Some(usage) = usage {
                total_usage.add(usage);
            }

            if !draft.tool_requests.is_empty() && tool_rounds < MAX_TOOL_ROUNDS {
                tool_rounds += 1;
                let held: Vec<String> = collected_schemas(&context.thread)
                    .iter()
                    .map(|s| s.entity.clone())
                    .collect();
                for request in &draft.tool_requests {
                    let result = match request.tool.as_str() {
                        "get_entity_schemas" => context
                            .tools
                            .get_entity_schemas(&request.search_text, 3, &held)
                            .await
                            .map(|schemas| json!({ "schemas": schemas })),
                        "get_column_values" => context
                            .tools
                            .get_column_values(&request.search_text, 5)
                            .await
                            .map(|values| json!({ "column_values": values })),
                        other => {
                            warn!(tool = other, "Model requested an unknown tool");
                            continue;
                        }
                    };
                    match result {
                        Ok(value) => extra_context.push(json!({
                            "tool": request.tool,
                            "search_text": request.search_text,
                            "result": value,
                        })),
                        Err(e) => extra_context.push(json!({
                            "tool": request.tool,
                            "search_text": request.search_text,
                            "error": e.to_string(),
                        })),
                    }
                }
                continue;
            }

            if let Some(sql) = draft.sql {
                let outcome = context.tools.validate_sql(&sql);
                if outcome.ok {
                    debug!(%sql, "Generated SQL validated");
                    return agent_message(
                        self.name(),
                        &GenerationOutput {
                            sql: Some(sql),
                            error: None,
                        },
                        Some(total_usage),
                    );
                }
                last_sql = Some(sql);
                validation_failures += 1;
                if validation_failures > VALIDATION_RETRIES {
                    // Hand the unparsable statement to correction with
                    // the errors attached.
                    return agent_message(
                        self.name(),
                        &GenerationOutput {
                            sql: last_sql,
                            error: Some(outcome.errors.join("; ")),
                        },
                        Some(total_usage),
                    );
                }
                extra_context.push(json!({
                    "previous_sql": last_sql,
                    "validation_errors": outcome.errors,
                }));
                continue;
            }

            return agent_message(
                self.name(),
                &GenerationOutput {
                    sql: None,
                    error: draft.error.or_else(|| Some("Model produced neither SQL nor an error".into())),
                },
                Some(total_usage),
            );
        }
    }
}
