//! Query rewrite: date resolution, topic gating, decomposition into
//! rounds of independent sub-questions. Runs once per run.

use crate::agents::{agent_message, AgentContext, SqlAgent};
use crate::prompts::{self, PromptContext};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sql_agent_common::llm::LlmClient;
use sql_agent_common::{AgentName, ChatRole, Message, Result};
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RewriteOutput {
    /// Rounds of sub-questions. Rounds run sequentially, members of one
    /// round run in parallel.
    pub decomposed_user_messages: Vec<Vec<String>>,
    /// How the sub-answers combine into the final answer.
    pub combination_logic: String,
    /// The message needs no database at all (chit-chat, off-topic,
    /// blocked).
    pub all_non_database_query: bool,
    /// Direct reply used when no SQL is needed.
    #[serde(default)]
    pub natural_language_response: Option<String>,
}

impl RewriteOutput {
    pub fn is_short_circuit(&self) -> bool {
        self.all_non_database_query || self.decomposed_user_messages.iter().flatten().next().is_none()
    }
}

pub struct QueryRewriteAgent {
    llm: Arc<LlmClient>,
}

impl QueryRewriteAgent {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl SqlAgent for QueryRewriteAgent {
    fn name(&self) -> AgentName {
        AgentName::QueryRewrite
    }

    #[instrument(skip_all)]
    async fn run(&self, context: &AgentContext) -> Result<Message> {
        let system = prompts::render(
            "query_rewrite_agent",
            &PromptContext::from_config(&context.config, context.run_started),
        )?;

        let history: Vec<serde_json::Value> = context
            .chat_history
            .iter()
            .map(|turn| {
                json!({
                    "role": match turn.role {
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    "content": turn.content,
                })
            })
            .collect();
        let user = json!({
            "user_question": context.question,
            "chat_history": history,
        })
        .to_string();

        let (output, usage) = self.llm.structured::<RewriteOutput>(&system, &user).await?;
        agent_message(self.name(), &output, usage)
    }
}
