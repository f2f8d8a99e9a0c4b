//! Correction: validate, execute, and repair SQL against the live
//! engine, bounded by `MAX_CORRECTION_ATTEMPTS`.

use crate::agents::{agent_message, last_json_from, AgentContext, SqlAgent};
use crate::prompts::{self, PromptContext};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sql_agent_common::llm::LlmClient;
use sql_agent_common::{AgentName, Message, QueryResult, Result, Text2SqlError, TokenUsage};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const MAX_CORRECTION_ATTEMPTS: usize = 5;

/// The model's repair step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CorrectionDraft {
    pub corrected_query: String,
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Terminal thread message: the executed result or the give-up report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionOutput {
    pub validated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_rows: Option<QueryResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempted_conversions: Vec<String>,
}

pub struct CorrectionAgent {
    llm: Arc<LlmClient>,
}

impl CorrectionAgent {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    /// The statement this invocation should work on: the latest generated
    /// SQL, falling back to the cache hit.
    fn candidate_sql(context: &AgentContext) -> Option<String> {
        if let Some(generation) = last_json_from(&context.thread, AgentName::Generation) {
            if let Some(sql) = generation.get("sql").and_then(|v| v.as_str()) {
                return Some(sql.to_string());
            }
        }
        last_json_from(&context.thread, AgentName::QueryCache)
            .and_then(|cache| cache.get("sql").and_then(|v| v.as_str()).map(str::to_string))
    }

    /// Pre-run rows already fetched for this exact statement, if any.
    fn pre_run_rows(context: &AgentContext, sql: &str) -> Option<QueryResult> {
        let cache = last_json_from(&context.thread, AgentName::QueryCache)?;
        if !cache.get("pre_run_results").and_then(|v| v.as_bool()).unwrap_or(false) {
            return None;
        }
        if cache.get("sql").and_then(|v| v.as_str()) != Some(sql) {
            return None;
        }
        serde_json::from_value(cache.get("rows").cloned()?).ok()
    }

    async fn repair(
        &self,
        context: &AgentContext,
        sql: &str,
        error: &str,
        usage: &mut TokenUsage,
    ) -> Result<CorrectionDraft> {
        let system = prompts::render(
            "sql_correction_agent",
            &PromptContext::from_config(&context.config, context.run_started),
        )?;
        let user = json!({
            "question": context.question,
            "sql": sql,
            "error": error,
        })
        .to_string();
        let (draft, step_usage) = self.llm.structured::<CorrectionDraft>(&system, &user).await?;
        if let Some(step_usage) = step_usage {
            usage.add(step_usage);
        }
        Ok(draft)
    }
}

#[async_trait]
impl SqlAgent for CorrectionAgent {
    fn name(&self) -> AgentName {
        AgentName::Correction
    }

    #[instrument(skip_all, fields(question = %context.question))]
    async fn run(&self, context: &AgentContext) -> Result<Message> {
        let mut usage = TokenUsage::default();
        let mut attempted_conversions: Vec<String> = Vec::new();

        let Some(mut sql) = Self::candidate_sql(context) else {
            return agent_message(
                self.name(),
                &CorrectionOutput {
                    validated: false,
                    sql_query: None,
                    sql_rows: None,
                    error: Some("No SQL statement available to correct".into()),
                    attempted_conversions,
                },
                None,
            );
        };

        // The cache agent already executed this exact statement; its rows
        // are fresh, one execution total.
        if let Some(rows) = Self::pre_run_rows(context, &sql) {
            info!("Using pre-run rows for cached statement");
            return agent_message(
                self.name(),
                &CorrectionOutput {
                    validated: true,
                    sql_query: Some(sql),
                    sql_rows: Some(rows),
                    error: None,
                    attempted_conversions,
                },
                None,
            );
        }

        let mut last_error = String::new();
        for attempt in 1..=MAX_CORRECTION_ATTEMPTS {
            let outcome = context.tools.validate_sql(&sql);
            if !outcome.ok {
                last_error = outcome.errors.join("; ");
                debug!(attempt, error = %last_error, "Statement failed to parse");
            } else {
                match context.tools.execute_sql(&sql).await {
                    Ok(rows) => {
                        info!(attempt, "Statement executed");
                        return agent_message(
                            self.name(),
                            &CorrectionOutput {
                                validated: true,
                                sql_query: Some(sql),
                                sql_rows: Some(rows),
                                error: None,
                                attempted_conversions,
                            },
                            Some(usage),
                        );
                    }
                    Err(Text2SqlError::Cancelled) => return Err(Text2SqlError::Cancelled),
                    Err(e) => {
                        last_error = e.to_string();
                        warn!(attempt, error = %last_error, "Execution failed");
                    }
                }
            }

            if attempt == MAX_CORRECTION_ATTEMPTS {
                break;
            }
            let draft = self.repair(context, &sql, &last_error, &mut usage).await?;
            if let Some(error) = draft.error {
                last_error = error;
                break;
            }
            attempted_conversions.extend(draft.changes);
            sql = draft.corrected_query;
        }

        agent_message(
            self.name(),
            &CorrectionOutput {
                validated: false,
                sql_query: Some(sql),
                sql_rows: None,
                error: Some(last_error),
                attempted_conversions,
            },
            Some(usage),
        )
    }
}
