//! Serialized run snapshot for disambiguation suspensions.
//!
//! Stored under the state store's schema version; round-trips through
//! serialize/deserialize with no semantic change.

use crate::agents::AnsweredSource;
use serde::{Deserialize, Serialize};
use sql_agent_common::payloads::DisambiguationRequest;
use sql_agent_common::{Message, Result, Run};

/// One sub-question parked on a clarification question, with its full
/// thread so resumption continues exactly where it stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSubQuestion {
    pub round_index: usize,
    pub index_in_round: usize,
    pub question: String,
    pub thread: Vec<Message>,
    pub requests: Vec<DisambiguationRequest>,
}

/// The whole suspended run: rounds, finished sources, parked
/// sub-questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendedRun {
    pub run: Run,
    pub current_round: usize,
    pub completed_sources: Vec<AnsweredSource>,
    pub pending: Vec<PendingSubQuestion>,
}

impl SuspendedRun {
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}
