//! Deterministic next-agent selection.
//!
//! A pure function of the in-memory thread: no I/O, no clock, no
//! randomness. Identical thread and configuration always produce the
//! same decision.

use serde_json::Value;
use sql_agent_common::{AgentName, Message, TerminationReason};

/// Literal token agents may emit to end a run.
pub const TERMINATE_TOKEN: &str = "TERMINATE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Agent(AgentName),
    /// Await a caller reply; the run suspends to the state store.
    Suspend,
    Terminate(TerminationReason),
}

#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub use_query_cache: bool,
    pub max_messages: usize,
}

/// Select the next agent for a thread. First match wins:
/// termination guards, then the per-source transition table.
pub fn select_next_agent(thread: &[Message], config: &RouterConfig) -> NextStep {
    let Some(last) = thread.last() else {
        return NextStep::Agent(AgentName::QueryRewrite);
    };

    if thread.len() >= config.max_messages {
        return NextStep::Terminate(TerminationReason::MaxMessages);
    }
    if last.content.contains(TERMINATE_TOKEN) {
        return NextStep::Terminate(TerminationReason::TerminateToken);
    }
    let content: Option<Value> = serde_json::from_str(&last.content).ok();
    if let Some(value) = &content {
        if value.get("answer").is_some() && value.get("sources").is_some() {
            return NextStep::Terminate(TerminationReason::AnswerAndSourcesPresent);
        }
    }

    match last.source {
        AgentName::User => NextStep::Agent(AgentName::QueryRewrite),
        AgentName::QueryRewrite => {
            if config.use_query_cache {
                NextStep::Agent(AgentName::QueryCache)
            } else {
                NextStep::Agent(AgentName::SchemaSelection)
            }
        }
        AgentName::QueryCache => match &content {
            Some(value) if flag(value, "cache_hit") => {
                if flag(value, "pre_run_results") {
                    NextStep::Agent(AgentName::Correction)
                } else {
                    NextStep::Agent(AgentName::Generation)
                }
            }
            _ => NextStep::Agent(AgentName::SchemaSelection),
        },
        AgentName::SchemaSelection => match &content {
            Some(value) if flag(value, "ambiguity_detected") => {
                NextStep::Agent(AgentName::Disambiguation)
            }
            _ => NextStep::Agent(AgentName::Generation),
        },
        AgentName::Disambiguation => match &content {
            Some(value) if has_requests(value) => NextStep::Suspend,
            _ => NextStep::Agent(AgentName::Generation),
        },
        AgentName::Generation => NextStep::Agent(AgentName::Correction),
        AgentName::Correction => match &content {
            Some(value) if flag(value, "validated") => NextStep::Agent(AgentName::Answer),
            Some(value) if value.get("corrected_query").is_some() && flag(value, "executing") => {
                NextStep::Agent(AgentName::Correction)
            }
            _ => NextStep::Agent(AgentName::Generation),
        },
        AgentName::Answer => NextStep::Terminate(TerminationReason::AnswerAndSourcesPresent),
    }
}

fn flag(value: &Value, key: &str) -> bool {
    value.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn has_requests(value: &Value) -> bool {
    value
        .get("requests")
        .and_then(|v| v.as_array())
        .map(|requests| !requests.is_empty())
        .unwrap_or(false)
}
