//! Final answer assembly: deterministic source collection plus one LLM
//! call for the narrative, and optionally one more for follow-up
//! suggestions.

use crate::agents::{agent_message, AgentContext, SqlAgent};
use crate::prompts::{self, PromptContext};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sql_agent_common::llm::LlmClient;
use sql_agent_common::payloads::Source;
use sql_agent_common::{AgentName, Message, Result, TokenUsage};
use std::sync::Arc;
use tracing::{instrument, warn};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct AnswerDraft {
    answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct FollowUpDraft {
    follow_up_suggestions: Vec<String>,
}

/// The agent's thread message, mirrored into the terminal payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerOutput {
    pub answer: String,
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up_suggestions: Option<Vec<String>>,
}

pub struct AnswerAgent {
    llm: Arc<LlmClient>,
}

impl AnswerAgent {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl SqlAgent for AnswerAgent {
    fn name(&self) -> AgentName {
        AgentName::Answer
    }

    #[instrument(skip_all)]
    async fn run(&self, context: &AgentContext) -> Result<Message> {
        let sources: Vec<Source> = context
            .prior_sources
            .iter()
            .map(|answered| match &answered.error {
                Some(error) => Source::from_error(answered.sql.clone(), error.clone()),
                None => Source::from_rows(answered.sql.clone(), answered.rows.clone()),
            })
            .collect();

        let system = prompts::render(
            "answer_agent",
            &PromptContext::from_config(&context.config, context.run_started),
        )?;
        let user = json!({
            "user_question": context.question,
            "combination_logic": context.combination_logic,
            "sub_questions": context.prior_sources,
        })
        .to_string();
        let (draft, usage) = self.llm.structured::<AnswerDraft>(&system, &user).await?;
        let mut total_usage = usage.unwrap_or_default();

        let follow_up_suggestions = if context.config.generate_follow_up_suggestions {
            let follow_up_system = prompts::render(
                "follow_up_suggestions_agent",
                &PromptContext::from_config(&context.config, context.run_started),
            )?;
            let follow_up_user = json!({
                "question": context.question,
                "answer": draft.answer,
            })
            .to_string();
            match self
                .llm
                .structured::<FollowUpDraft>(&follow_up_system, &follow_up_user)
                .await
            {
                Ok((follow_up, follow_up_usage)) => {
                    if let Some(follow_up_usage) = follow_up_usage {
                        total_usage.add(follow_up_usage);
                    }
                    let mut suggestions = follow_up.follow_up_suggestions;
                    suggestions.truncate(3);
                    Some(suggestions)
                }
                Err(e) => {
                    // Non-fatal; the answer goes out without suggestions.
                    warn!(error = %e, "Follow-up suggestion generation failed");
                    None
                }
            }
        } else {
            None
        };

        agent_message(
            self.name(),
            &AnswerOutput {
                answer: draft.answer,
                sources,
                follow_up_suggestions,
            },
            Some(total_usage),
        )
    }
}
