use thiserror::Error;

#[derive(Error, Debug)]
pub enum Text2SqlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Input rejected: {0}")]
    InputRejected(String),

    #[error("No entity schemas found for: {0}")]
    SchemaNotFound(String),

    #[error("SQL syntax error: {0}")]
    SqlSyntax(String),

    #[error("SQL execution error: {0}")]
    SqlExecution(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Tool '{tool}' timed out after {seconds}s")]
    ToolTimeout { tool: String, seconds: u64 },

    #[error("Run exceeded wall-clock timeout of {0}s")]
    RunTimeout(u64),

    #[error("Run exceeded the message limit of {0}")]
    MessageLimit(usize),

    #[error("Cache write failure: {0}")]
    CacheWrite(String),

    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Text2SqlError {
    /// Whether a bounded retry with unchanged arguments is worth attempting.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::SqlExecution(_) | Self::Search(_) | Self::ToolTimeout { .. } | Self::Llm(_)
        )
    }

    /// Stable machine-readable code carried on outbound error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::InputRejected(_) => "input_rejected",
            Self::SchemaNotFound(_) => "schema_not_found",
            Self::SqlSyntax(_) => "sql_syntax_error",
            Self::SqlExecution(_) => "sql_execution_error",
            Self::Llm(_) => "llm_error",
            Self::Search(_) => "search_error",
            Self::ToolTimeout { .. } => "tool_timeout",
            Self::RunTimeout(_) => "run_timeout",
            Self::MessageLimit(_) => "message_limit",
            Self::CacheWrite(_) => "cache_write_failure",
            Self::StateStore(_) => "state_store_error",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Text2SqlError>;
