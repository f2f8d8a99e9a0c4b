//! Disambiguation: map filter and aggregation terms onto columns, or
//! surface clarification questions the caller must answer.

use crate::agents::{agent_message, last_json_from, AgentContext, SqlAgent};
use crate::prompts::{self, PromptContext};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sql_agent_common::llm::LlmClient;
use sql_agent_common::payloads::DisambiguationRequest;
use sql_agent_common::{AgentName, Message, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DisambiguationOutput {
    /// Non-empty means the run must suspend and ask the caller.
    #[serde(default)]
    pub requests: Vec<DisambiguationRequest>,
    /// Filter term to chosen "Entity.Column" / canonical values.
    #[serde(default)]
    pub filter_mapping: BTreeMap<String, Vec<String>>,
    /// Aggregation phrase to column.
    #[serde(default)]
    pub aggregation_mapping: BTreeMap<String, String>,
}

impl DisambiguationOutput {
    pub fn needs_clarification(&self) -> bool {
        !self.requests.is_empty()
    }
}

pub struct DisambiguationAgent {
    llm: Arc<LlmClient>,
}

impl DisambiguationAgent {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl SqlAgent for DisambiguationAgent {
    fn name(&self) -> AgentName {
        AgentName::Disambiguation
    }

    #[instrument(skip_all, fields(question = %context.question))]
    async fn run(&self, context: &AgentContext) -> Result<Message> {
        let system = prompts::render(
            "disambiguation_agent",
            &PromptContext::from_config(&context.config, context.run_started),
        )?;

        let selection = last_json_from(&context.thread, AgentName::SchemaSelection)
            .unwrap_or_else(|| json!({}));
        let user = json!({
            "question": context.question,
            "schemas": selection.get("schema_options").cloned().unwrap_or_else(|| json!([])),
            "column_values": selection.get("column_values").cloned().unwrap_or_else(|| json!([])),
        })
        .to_string();

        let (output, usage) = self.llm.structured::<DisambiguationOutput>(&system, &user).await?;
        agent_message(self.name(), &output, usage)
    }
}
