//! Wire-level request/response payloads for the streaming caller API.

use crate::types::{AgentName, QueryResult, ThreadId, TokenUsage, Turn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Inbound request: one user message plus optional history and template
/// parameters for cached SQL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserMessagePayload {
    pub user_message: String,
    #[serde(default)]
    pub chat_history: Vec<Turn>,
    #[serde(default)]
    pub injected_parameters: BTreeMap<String, Value>,
}

impl UserMessagePayload {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            ..Default::default()
        }
    }

    /// Fill in the whitelisted template defaults without overriding
    /// anything the caller supplied. `now` is the run-scoped timestamp so
    /// every template in the run renders the same instant.
    pub fn with_default_parameters(mut self, now: DateTime<Utc>) -> Self {
        let defaults = [
            ("date", Value::from(now.format("%d/%m/%Y").to_string())),
            ("time", Value::from(now.format("%H:%M:%S").to_string())),
            ("datetime", Value::from(now.format("%d/%m/%Y, %H:%M:%S").to_string())),
            ("unix_timestamp", Value::from(now.timestamp())),
        ];
        for (key, value) in defaults {
            self.injected_parameters.entry(key.to_string()).or_insert(value);
        }
        self
    }
}

/// One SQL query and the rows backing part of the final answer. `error` is
/// populated when the sub-question failed but the run still answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub sql_query: String,
    pub sql_rows: QueryResult,
    pub markdown_table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Source {
    pub fn from_rows(sql_query: impl Into<String>, sql_rows: QueryResult) -> Self {
        let markdown_table = sql_rows.to_markdown();
        Self {
            sql_query: sql_query.into(),
            sql_rows,
            markdown_table,
            error: None,
        }
    }

    pub fn from_error(sql_query: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            sql_query: sql_query.into(),
            sql_rows: QueryResult::default(),
            markdown_table: String::new(),
            error: Some(error.into()),
        }
    }
}

/// One clarification question the caller must answer before the run can
/// resume.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct DisambiguationRequest {
    pub question: String,
    #[serde(default)]
    pub matching_columns: Vec<String>,
    #[serde(default)]
    pub matching_filter_values: Vec<String>,
    #[serde(default)]
    pub other_user_choices: Vec<String>,
}

impl DisambiguationRequest {
    /// All candidate choices, in presentation order.
    pub fn choices(&self) -> Vec<String> {
        self.matching_columns
            .iter()
            .chain(self.matching_filter_values.iter())
            .chain(self.other_user_choices.iter())
            .cloned()
            .collect()
    }
}

/// Payload body variants streamed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "payload_type", rename_all = "snake_case")]
pub enum PayloadBody {
    ProcessingUpdate {
        title: String,
        message: String,
    },
    Thought {
        agent: AgentName,
        content: String,
    },
    Disambiguation {
        requests: Vec<DisambiguationRequest>,
    },
    AnswerWithSources {
        answer: String,
        sources: Vec<Source>,
        #[serde(skip_serializing_if = "Option::is_none")]
        follow_up_suggestions: Option<Vec<String>>,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

impl PayloadBody {
    /// Terminal payloads end the stream; the caller must issue a new
    /// request (same thread for disambiguation) to continue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Disambiguation { .. } | Self::AnswerWithSources { .. } | Self::Error { .. }
        )
    }
}

/// Envelope for every streamed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub thread_id: ThreadId,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(flatten)]
    pub body: PayloadBody,
}

impl OutboundPayload {
    pub fn new(thread_id: ThreadId, body: PayloadBody) -> Self {
        Self {
            thread_id,
            timestamp: Utc::now(),
            token_usage: None,
            body,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }

    pub fn processing(thread_id: ThreadId, message: impl Into<String>) -> Self {
        Self::new(
            thread_id,
            PayloadBody::ProcessingUpdate {
                title: "Processing...".to_string(),
                message: message.into(),
            },
        )
    }
}
