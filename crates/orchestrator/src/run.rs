//! Per-sub-question execution: the cooperative loop that walks one
//! sub-question through cache, schema selection, disambiguation,
//! generation and correction until it terminates or suspends.

use crate::agents::{collected_schemas, last_json_from, AgentContext, AgentSet, SqlAgent};
use crate::router::{select_next_agent, NextStep, RouterConfig};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sql_agent_common::payloads::{DisambiguationRequest, PayloadBody};
use sql_agent_common::{
    AgentName, Message, QueryResult, Result, TerminationReason, Text2SqlConfig, Text2SqlError, Turn,
};
use sql_agent_retrieval::EntitySchema;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

const AGENT_RETRY_ATTEMPTS: usize = 3;
const AGENT_RETRY_BACKOFF_MS: u64 = 250;

/// Observable state of one sub-run, derived from its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Start,
    RewriteConsumed,
    CacheCheck,
    SchemaSelecting,
    CacheHitWithRows,
    CacheHitNoRows,
    SchemasReady,
    Disambiguating,
    Generating,
    Correcting,
    Executing,
    Answering,
    Terminal,
}

/// Derive the machine state from the thread's last message.
pub fn machine_state(thread: &[Message]) -> MachineState {
    let Some(last) = thread.last() else {
        return MachineState::Start;
    };
    let content: Option<Value> = serde_json::from_str(&last.content).ok();
    let flag = |key: &str| {
        content
            .as_ref()
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };

    match last.source {
        AgentName::User => MachineState::Start,
        AgentName::QueryRewrite => MachineState::RewriteConsumed,
        AgentName::QueryCache => {
            if flag("cache_hit") {
                if flag("pre_run_results") {
                    MachineState::CacheHitWithRows
                } else {
                    MachineState::CacheHitNoRows
                }
            } else {
                MachineState::SchemaSelecting
            }
        }
        AgentName::SchemaSelection => {
            if flag("ambiguity_detected") {
                MachineState::Disambiguating
            } else {
                MachineState::SchemasReady
            }
        }
        AgentName::Disambiguation => {
            let pending = content
                .as_ref()
                .and_then(|v| v.get("requests"))
                .and_then(|v| v.as_array())
                .map(|r| !r.is_empty())
                .unwrap_or(false);
            if pending {
                MachineState::Disambiguating
            } else {
                MachineState::Generating
            }
        }
        AgentName::Generation => MachineState::Correcting,
        AgentName::Correction => {
            if flag("validated") {
                MachineState::Answering
            } else if flag("executing") {
                MachineState::Executing
            } else {
                MachineState::Generating
            }
        }
        AgentName::Answer => MachineState::Terminal,
    }
}

/// Terminal outcome of one sub-run.
#[derive(Debug, Clone)]
pub enum SubRunOutcome {
    Answered {
        sql: String,
        rows: QueryResult,
        schemas: Vec<EntitySchema>,
        thread: Vec<Message>,
    },
    ClarificationNeeded {
        requests: Vec<DisambiguationRequest>,
        thread: Vec<Message>,
    },
    Failed {
        error: String,
        thread: Vec<Message>,
    },
}

/// Run one agent with bounded retries on transient failures.
pub(crate) async fn invoke_agent(agent: &Arc<dyn SqlAgent>, context: &AgentContext) -> Result<Message> {
    let mut last_error = None;
    for attempt in 0..AGENT_RETRY_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(AGENT_RETRY_BACKOFF_MS * (1 << attempt))).await;
        }
        match agent.run(context).await {
            Ok(message) => return Ok(message),
            Err(e) if e.is_retriable() => {
                warn!(agent = %agent.name(), attempt, error = %e, "Agent invocation failed");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or(Text2SqlError::Cancelled))
}

/// The cooperative sub-question solver. No state is shared between
/// concurrent sub-runs; each owns its thread.
pub struct InnerRun {
    pub agents: AgentSet,
    pub config: Arc<Text2SqlConfig>,
    pub tools: Arc<crate::tools::ToolRegistry>,
    pub cancel: Arc<AtomicBool>,
    /// Diagnostic stream; `None` when the caller does not want thoughts.
    pub progress: Option<mpsc::Sender<PayloadBody>>,
}

impl InnerRun {
    /// Seed thread for a fresh sub-run: the user question plus the
    /// consumed rewrite, so routing starts at cache/schema selection.
    pub fn seed_thread(question: &str, injected_parameters: &BTreeMap<String, Value>) -> Vec<Message> {
        vec![
            Message::new(
                AgentName::User,
                json!({
                    "question": question,
                    "injected_parameters": injected_parameters,
                })
                .to_string(),
            ),
            Message::new(
                AgentName::QueryRewrite,
                json!({ "sub_question": question }).to_string(),
            ),
        ]
    }

    /// Resolution message appended when the caller answers a
    /// clarification; routing then resumes at generation.
    pub fn clarification_reply(reply: &str) -> Message {
        Message::new(
            AgentName::Disambiguation,
            json!({
                "requests": [],
                "resolved": true,
                "user_response": reply,
            })
            .to_string(),
        )
    }

    #[instrument(skip_all, fields(question = %question))]
    pub async fn solve(
        &self,
        question: &str,
        run_started: DateTime<Utc>,
        chat_history: Vec<Turn>,
        injected_parameters: BTreeMap<String, Value>,
        prior_sources: Vec<crate::agents::AnsweredSource>,
        initial_thread: Option<Vec<Message>>,
    ) -> SubRunOutcome {
        let mut thread =
            initial_thread.unwrap_or_else(|| Self::seed_thread(question, &injected_parameters));
        let router_config = RouterConfig {
            use_query_cache: self.config.use_query_cache,
            max_messages: self.config.max_messages,
        };

        loop {
            // Cooperative cancellation, checked between agent invocations.
            if self.cancel.load(Ordering::Relaxed) {
                return SubRunOutcome::Failed {
                    error: "cancelled".into(),
                    thread,
                };
            }

            let next = select_next_agent(&thread, &router_config);
            debug!(state = ?machine_state(&thread), ?next, "Routing");

            match next {
                NextStep::Terminate(reason) => return self.outcome_from_thread(thread, reason),
                NextStep::Suspend => {
                    let requests = last_json_from(&thread, AgentName::Disambiguation)
                        .and_then(|value| {
                            serde_json::from_value::<Vec<DisambiguationRequest>>(
                                value.get("requests").cloned().unwrap_or_else(|| json!([])),
                            )
                            .ok()
                        })
                        .unwrap_or_default();
                    info!(count = requests.len(), "Sub-run awaiting clarification");
                    return SubRunOutcome::ClarificationNeeded { requests, thread };
                }
                // The answer agent runs once at the outer level over all
                // sub-runs; reaching it means this sub-run is done.
                NextStep::Agent(AgentName::Answer) => {
                    return self.outcome_from_thread(thread, TerminationReason::AnswerAndSourcesPresent)
                }
                NextStep::Agent(name) => {
                    let Some(agent) = self.agents.get(name) else {
                        return SubRunOutcome::Failed {
                            error: format!("No agent registered for {name}"),
                            thread,
                        };
                    };
                    let context = AgentContext {
                        config: self.config.clone(),
                        tools: self.tools.clone(),
                        run_started,
                        chat_history: chat_history.clone(),
                        question: question.to_string(),
                        thread: thread.clone(),
                        injected_parameters: injected_parameters.clone(),
                        prior_sources: prior_sources.clone(),
                        combination_logic: None,
                    };
                    match invoke_agent(&agent, &context).await {
                        Ok(message) => {
                            if let Some(progress) = &self.progress {
                                let _ = progress
                                    .send(PayloadBody::Thought {
                                        agent: name,
                                        content: message.content.clone(),
                                    })
                                    .await;
                            }
                            thread.push(message);
                        }
                        Err(Text2SqlError::Cancelled) => {
                            return SubRunOutcome::Failed {
                                error: "cancelled".into(),
                                thread,
                            }
                        }
                        Err(e) => {
                            return SubRunOutcome::Failed {
                                error: e.to_string(),
                                thread,
                            }
                        }
                    }
                }
            }
        }
    }

    fn outcome_from_thread(&self, thread: Vec<Message>, reason: TerminationReason) -> SubRunOutcome {
        if let Some(correction) = last_json_from(&thread, AgentName::Correction) {
            let validated = correction
                .get("validated")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if validated {
                let sql = correction
                    .get("sql_query")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let rows = correction
                    .get("sql_rows")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let schemas = collected_schemas(&thread);
                return SubRunOutcome::Answered {
                    sql,
                    rows,
                    schemas,
                    thread,
                };
            }
            if let Some(error) = correction.get("error").and_then(|v| v.as_str()) {
                return SubRunOutcome::Failed {
                    error: error.to_string(),
                    thread,
                };
            }
        }

        let error = match reason {
            TerminationReason::MaxMessages => {
                Text2SqlError::MessageLimit(self.config.max_messages).to_string()
            }
            _ => "Sub-run terminated without an executed query".to_string(),
        };
        SubRunOutcome::Failed { error, thread }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_thread_starts_after_rewrite() {
        let thread = InnerRun::seed_thread("How many orders?", &BTreeMap::new());
        assert_eq!(machine_state(&thread), MachineState::RewriteConsumed);
    }

    #[test]
    fn machine_states_follow_the_thread() {
        let mut thread = InnerRun::seed_thread("q", &BTreeMap::new());
        thread.push(Message::new(
            AgentName::QueryCache,
            json!({"cache_hit": false}).to_string(),
        ));
        assert_eq!(machine_state(&thread), MachineState::SchemaSelecting);

        thread.push(Message::new(
            AgentName::SchemaSelection,
            json!({"schema_options": [], "ambiguity_detected": false}).to_string(),
        ));
        assert_eq!(machine_state(&thread), MachineState::SchemasReady);

        thread.push(Message::new(
            AgentName::Generation,
            json!({"sql": "SELECT 1"}).to_string(),
        ));
        assert_eq!(machine_state(&thread), MachineState::Correcting);

        thread.push(Message::new(
            AgentName::Correction,
            json!({"validated": true, "sql_query": "SELECT 1"}).to_string(),
        ));
        assert_eq!(machine_state(&thread), MachineState::Answering);
    }

    #[test]
    fn cache_states_distinguish_pre_run() {
        let mut thread = InnerRun::seed_thread("q", &BTreeMap::new());
        thread.push(Message::new(
            AgentName::QueryCache,
            json!({"cache_hit": true, "pre_run_results": true}).to_string(),
        ));
        assert_eq!(machine_state(&thread), MachineState::CacheHitWithRows);

        thread.pop();
        thread.push(Message::new(
            AgentName::QueryCache,
            json!({"cache_hit": true, "pre_run_results": false}).to_string(),
        ));
        assert_eq!(machine_state(&thread), MachineState::CacheHitNoRows);
    }

    #[test]
    fn clarification_reply_resumes_at_generation() {
        let mut thread = InnerRun::seed_thread("q", &BTreeMap::new());
        thread.push(Message::new(
            AgentName::Disambiguation,
            json!({"requests": [{"question": "Which?", "matching_columns": ["a", "b"]}]}).to_string(),
        ));
        assert_eq!(machine_state(&thread), MachineState::Disambiguating);

        thread.push(InnerRun::clarification_reply("the first one"));
        assert_eq!(machine_state(&thread), MachineState::Generating);
    }
}
