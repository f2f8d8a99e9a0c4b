//! Thin chat-completion client over Ollama with schema-constrained output.
//!
//! Agents describe their output types with `schemars` and the model is held
//! to that schema by the backend's structured JSON mode.

use crate::config::LlmConfig;
use crate::error::{Result, Text2SqlError};
use crate::types::TokenUsage;
use ollama_rs::generation::chat::request::ChatMessageRequest;
use ollama_rs::generation::chat::{ChatMessage, ChatMessageResponse};
use ollama_rs::generation::parameters::{FormatType, JsonStructure};
use ollama_rs::Ollama;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct LlmClient {
    client: Ollama,
    model: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: Ollama::new(config.host.clone(), config.port),
            model: config.model.clone(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One completion constrained to the JSON schema of `T`.
    #[instrument(skip(self, system, user), fields(model = %self.model))]
    pub async fn structured<T>(&self, system: &str, user: &str) -> Result<(T, Option<TokenUsage>)>
    where
        T: JsonSchema + DeserializeOwned,
    {
        let request = ChatMessageRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(system.to_string()),
                ChatMessage::user(user.to_string()),
            ],
        )
        .format(FormatType::StructuredJson(Box::new(JsonStructure::new::<T>())));

        let response = self
            .client
            .send_chat_messages(request)
            .await
            .map_err(|e| Text2SqlError::Llm(e.to_string()))?;
        let usage = extract_usage(&response);
        debug!(content = %response.message.content, "structured completion");

        let parsed = serde_json::from_str(&response.message.content)
            .map_err(|e| Text2SqlError::Llm(format!("Malformed structured output: {e}")))?;
        Ok((parsed, usage))
    }

    /// Plain natural-language completion.
    #[instrument(skip(self, system, user), fields(model = %self.model))]
    pub async fn text(&self, system: &str, user: &str) -> Result<(String, Option<TokenUsage>)> {
        let request = ChatMessageRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(system.to_string()),
                ChatMessage::user(user.to_string()),
            ],
        );

        let response = self
            .client
            .send_chat_messages(request)
            .await
            .map_err(|e| Text2SqlError::Llm(e.to_string()))?;
        let usage = extract_usage(&response);
        Ok((response.message.content, usage))
    }
}

fn extract_usage(response: &ChatMessageResponse) -> Option<TokenUsage> {
    response.final_data.as_ref().map(|data| TokenUsage {
        prompt_tokens: data.prompt_eval_count as u32,
        completion_tokens: data.eval_count as u32,
    })
}
