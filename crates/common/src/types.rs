use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::{self};
use strum_macros::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// Hard ceiling on rows returned by any connector, regardless of configuration.
pub const HARD_ROW_CAP: usize = 10_000;

/// Unique identifier for a caller conversation thread
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one processing run of a user message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supported relational backends
#[derive(
    JsonSchema, Display, EnumString, EnumIter, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatabaseEngine {
    Tsql,
    Postgres,
    Snowflake,
    Databricks,
    Sqlite,
}

impl DatabaseEngine {
    /// Entity-document fields that only exist for this engine. Warehouse
    /// engines carry an extra level above `database.schema.entity`.
    pub fn specific_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Snowflake => &["Warehouse", "Database"],
            Self::Databricks => &["Catalog"],
            Self::Tsql | Self::Postgres => &["Database"],
            Self::Sqlite => &[],
        }
    }

    /// Row-limiting clause template used in prompt rules.
    pub fn row_limit_clause(&self, n: usize) -> String {
        match self {
            Self::Tsql => format!("SELECT TOP {n} ..."),
            _ => format!("... LIMIT {n}"),
        }
    }
}

/// The agents addressable by the router. `User` marks caller messages in
/// the thread; it is never selected as a next speaker.
#[derive(
    Display, EnumString, EnumIter, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    User,
    QueryRewrite,
    QueryCache,
    SchemaSelection,
    Disambiguation,
    Generation,
    Correction,
    Answer,
}

/// Token accounting reported by the model backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// One prior conversation turn supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// Message appended to an agent thread. Append-only within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub source: AgentName,
    pub content: String,
    pub token_usage: Option<TokenUsage>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(source: AgentName, content: impl Into<String>) -> Self {
        Self {
            source,
            content: content.into(),
            token_usage: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }
}

/// Result of executing one SELECT against a backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub truncated: bool,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Render rows as a GitHub-style markdown table.
    pub fn to_markdown(&self) -> String {
        if self.columns.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        out.push_str(&format!("| {} |\n", self.columns.join(" | ")));
        out.push_str(&format!(
            "|{}\n",
            self.columns.iter().map(|_| "---|").collect::<String>()
        ));
        for row in &self.rows {
            let cells: Vec<String> = row
                .iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.replace('|', "\\|"),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                })
                .collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        out
    }
}

/// Lifecycle of one decomposed sub-question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubQuestionStatus {
    Pending,
    Running,
    AwaitingClarification,
    Succeeded,
    Failed,
}

/// One atomic natural-language question produced by decomposition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuestion {
    pub id: Uuid,
    pub text: String,
    pub round_index: usize,
    pub parent_id: RunId,
    pub resolved_sql: Option<String>,
    pub resolved_rows: Option<QueryResult>,
    pub status: SubQuestionStatus,
    pub error: Option<String>,
}

impl SubQuestion {
    pub fn new(text: impl Into<String>, round_index: usize, parent_id: RunId) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            round_index,
            parent_id,
            resolved_sql: None,
            resolved_rows: None,
            status: SubQuestionStatus::Pending,
            error: None,
        }
    }
}

/// Why a run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    TerminateToken,
    AnswerAndSourcesPresent,
    MaxMessages,
    UnrecoverableError,
}

/// Full lifecycle state for processing one user message, including
/// resumptions after a disambiguation round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub thread_id: ThreadId,
    pub user_message: String,
    pub rewritten_message: Option<String>,
    pub combination_logic: Option<String>,
    pub decomposition_rounds: Vec<Vec<SubQuestion>>,
    pub thread: Vec<Message>,
    pub current_agent: Option<AgentName>,
    pub termination_reason: Option<TerminationReason>,
    /// Wall-clock captured once at run start; `current_datetime` is
    /// deterministic for the whole run.
    pub started_at: DateTime<Utc>,
}

impl Run {
    pub fn new(thread_id: ThreadId, user_message: impl Into<String>) -> Self {
        let user_message = user_message.into();
        let mut run = Self {
            run_id: RunId::new(),
            thread_id,
            user_message: user_message.clone(),
            rewritten_message: None,
            combination_logic: None,
            decomposition_rounds: vec![],
            thread: vec![],
            current_agent: None,
            termination_reason: None,
            started_at: Utc::now(),
        };
        run.thread.push(Message::new(AgentName::User, user_message));
        run
    }

    pub fn message_count(&self) -> usize {
        self.thread.len()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.thread.last()
    }

    /// Sub-questions flattened in round+index order, the order the final
    /// answer agent sees sources in.
    pub fn sub_questions(&self) -> impl Iterator<Item = &SubQuestion> {
        self.decomposition_rounds.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_round_trips_through_strings() {
        use std::str::FromStr;
        assert_eq!(DatabaseEngine::Tsql.to_string(), "TSQL");
        assert_eq!(DatabaseEngine::from_str("snowflake").unwrap(), DatabaseEngine::Snowflake);
    }

    #[test]
    fn agent_names_are_snake_case() {
        assert_eq!(AgentName::QueryRewrite.to_string(), "query_rewrite");
        assert_eq!(AgentName::SchemaSelection.to_string(), "schema_selection");
    }

    #[test]
    fn run_starts_with_the_user_message() {
        let run = Run::new(ThreadId::new(), "how many orders in 2008?");
        assert_eq!(run.message_count(), 1);
        assert_eq!(run.last_message().unwrap().source, AgentName::User);
    }

    #[test]
    fn markdown_table_escapes_pipes() {
        let result = QueryResult {
            columns: vec!["name".into(), "n".into()],
            rows: vec![vec!["a|b".into(), serde_json::json!(3)]],
            truncated: false,
        };
        let table = result.to_markdown();
        assert!(table.contains("| name | n |"));
        assert!(table.contains("a\\|b"));
    }
}
