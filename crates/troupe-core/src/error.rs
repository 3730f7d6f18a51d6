use thiserror::Error;

use crate::topology::ValidationReport;

#[derive(Debug, Error)]
pub enum TroupeError {
    // Topology / input errors
    #[error("topology validation failed: {0}")]
    TopologyInvalid(ValidationReport),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Lookup errors
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    // Conflict errors
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("execution is not running: {0}")]
    ExecutionNotRunning(String),

    // Admission
    #[error("concurrency limit exceeded ({limit} executions running)")]
    ConcurrencyLimitExceeded { limit: usize },

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("model not registered: {provider}/{model_id}")]
    UnknownModel { provider: String, model_id: String },

    // Tool errors
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    // Execution lifecycle
    #[error("execution cancelled")]
    Cancelled,

    #[error("execution timed out after {0}s")]
    TimedOut(u64),

    // Config errors
    #[error("config error: {0}")]
    Config(String),

    // Storage errors
    #[error("database error: {0}")]
    Database(String),

    // I/O and JSON plumbing
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TroupeError {
    /// True when retrying the same request may succeed (network blips,
    /// rate limits, upstream 5xx). Everything else fails fast.
    pub fn is_transient(&self) -> bool {
        match self {
            TroupeError::LlmRequest(msg) => {
                msg.contains("429")
                    || msg.contains("500")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("504")
                    || msg.contains("timeout")
                    || msg.contains("connection")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TroupeError>;
