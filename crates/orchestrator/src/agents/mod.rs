//! Agent abstractions and the concrete pipeline agents.
//!
//! Agents share one object-safe capability: consume the run context and
//! append one message to the thread. Message contents are JSON documents;
//! the router and downstream agents read artifacts (schemas, mappings,
//! executed rows) back out of the thread.

pub mod answer;
pub mod cache_check;
pub mod correction;
pub mod disambiguation;
pub mod generation;
pub mod rewrite;
pub mod schema_selection;

pub use answer::AnswerAgent;
pub use cache_check::CacheCheckAgent;
pub use correction::CorrectionAgent;
pub use disambiguation::DisambiguationAgent;
pub use generation::GenerationAgent;
pub use rewrite::QueryRewriteAgent;
pub use schema_selection::SchemaSelectionAgent;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sql_agent_common::llm::LlmClient;
use sql_agent_common::{AgentName, Message, QueryResult, Result, Text2SqlConfig, TokenUsage, Turn};
use sql_agent_retrieval::EntitySchema;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::tools::ToolRegistry;

/// One completed sub-question carried into later rounds and the final
/// answer.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct AnsweredSource {
    pub question: String,
    pub sql: String,
    pub rows: QueryResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything an agent may need to produce its message.
#[derive(Clone)]
pub struct AgentContext {
    pub config: Arc<Text2SqlConfig>,
    pub tools: Arc<ToolRegistry>,
    /// Captured once at run start; all date handling in the run derives
    /// from this instant.
    pub run_started: DateTime<Utc>,
    pub chat_history: Vec<Turn>,
    /// The question under work: the raw user message for the rewrite
    /// agent, a single sub-question inside a sub-run.
    pub question: String,
    pub thread: Vec<Message>,
    pub injected_parameters: BTreeMap<String, Value>,
    /// Completed earlier-round results, in round+index order.
    pub prior_sources: Vec<AnsweredSource>,
    pub combination_logic: Option<String>,
}

impl AgentContext {
    pub fn new(config: Arc<Text2SqlConfig>, tools: Arc<ToolRegistry>, question: impl Into<String>) -> Self {
        Self {
            config,
            tools,
            run_started: Utc::now(),
            chat_history: vec![],
            question: question.into(),
            thread: vec![],
            injected_parameters: BTreeMap::new(),
            prior_sources: vec![],
            combination_logic: None,
        }
    }

    pub fn with_run_started(mut self, run_started: DateTime<Utc>) -> Self {
        self.run_started = run_started;
        self
    }

    pub fn with_chat_history(mut self, chat_history: Vec<Turn>) -> Self {
        self.chat_history = chat_history;
        self
    }

    pub fn with_injected_parameters(mut self, parameters: BTreeMap<String, Value>) -> Self {
        self.injected_parameters = parameters;
        self
    }

    pub fn with_prior_sources(mut self, prior_sources: Vec<AnsweredSource>) -> Self {
        self.prior_sources = prior_sources;
        self
    }

    pub fn with_combination_logic(mut self, combination_logic: impl Into<String>) -> Self {
        self.combination_logic = Some(combination_logic.into());
        self
    }
}

/// The capability every pipeline agent implements.
#[async_trait]
pub trait SqlAgent: Send + Sync {
    fn name(&self) -> AgentName;

    async fn run(&self, context: &AgentContext) -> Result<Message>;
}

/// Serialize an agent output into its thread message.
pub fn agent_message<T: Serialize>(source: AgentName, output: &T, usage: Option<TokenUsage>) -> Result<Message> {
    let content = serde_json::to_string(output)?;
    let mut message = Message::new(source, content);
    if let Some(usage) = usage {
        message = message.with_usage(usage);
    }
    Ok(message)
}

/// Latest JSON message content from a given agent, newest first.
pub fn last_json_from(thread: &[Message], source: AgentName) -> Option<Value> {
    thread
        .iter()
        .rev()
        .find(|m| m.source == source)
        .and_then(|m| serde_json::from_str(&m.content).ok())
}

/// Schemas accumulated in the thread: schema selection results first,
/// falling back to the cache hit's schemas.
pub fn collected_schemas(thread: &[Message]) -> Vec<EntitySchema> {
    if let Some(value) = last_json_from(thread, AgentName::SchemaSelection) {
        if let Some(schemas) = value.get("schema_options") {
            if let Ok(parsed) = serde_json::from_value::<Vec<EntitySchema>>(schemas.clone()) {
                if !parsed.is_empty() {
                    return parsed;
                }
            }
        }
    }
    if let Some(value) = last_json_from(thread, AgentName::QueryCache) {
        if let Some(schemas) = value.get("schemas") {
            if let Ok(parsed) = serde_json::from_value::<Vec<EntitySchema>>(schemas.clone()) {
                return parsed;
            }
        }
    }
    vec![]
}

/// The agents addressable by the run loop.
#[derive(Default, Clone)]
pub struct AgentSet {
    agents: HashMap<AgentName, Arc<dyn SqlAgent>>,
}

impl AgentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, agent: Arc<dyn SqlAgent>) -> Self {
        self.agents.insert(agent.name(), agent);
        self
    }

    pub fn get(&self, name: AgentName) -> Option<Arc<dyn SqlAgent>> {
        self.agents.get(&name).cloned()
    }

    /// The full LLM-backed pipeline.
    pub fn with_llm_defaults(llm: Arc<LlmClient>, config: &Text2SqlConfig) -> Self {
        let mut set = Self::new()
            .insert(Arc::new(QueryRewriteAgent::new(llm.clone())))
            .insert(Arc::new(SchemaSelectionAgent::new(llm.clone())))
            .insert(Arc::new(DisambiguationAgent::new(llm.clone())))
            .insert(Arc::new(GenerationAgent::new(llm.clone())))
            .insert(Arc::new(CorrectionAgent::new(llm.clone())))
            .insert(Arc::new(AnswerAgent::new(llm)));
        if config.use_query_cache {
            set = set.insert(Arc::new(CacheCheckAgent::new()));
        }
        set
    }
}
