use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::chat::{CompletionRequest, CompletionResponse, ToolOutput};
use crate::error::Result;
use crate::types::{Execution, ExecutionId, ExecutionLog, ExecutionStatus, Team, TeamId};

/// LLM client — one resolved `(provider, model_id)` binding.
pub trait LlmClient: Send + Sync + 'static {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>>;
}

/// Read-only lookup from a model reference to a callable client.
/// Credential storage and rotation live behind this seam.
pub trait ModelRegistry: Send + Sync + 'static {
    fn resolve(&self, provider: &str, model_id: &str) -> Option<Arc<dyn LlmClient>>;

    fn contains(&self, provider: &str, model_id: &str) -> bool {
        self.resolve(provider, model_id).is_some()
    }
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub execution_id: ExecutionId,
    pub node_id: String,
}

/// Tool — named capability producing a text result.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in model tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Name → tool lookup seam consumed by the validator and the agent step.
pub trait ToolSource: Send + Sync + 'static {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>>;
}

/// Filters for execution listing. `limit` is clamped to 1..=100 by the
/// repository; ordering is `created_at DESC`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub team_id: Option<TeamId>,
    pub status: Option<ExecutionStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub offset: u64,
    pub limit: u64,
}

/// Filters for execution log queries, ordered by sequence.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub event_type: Option<String>,
    pub node_id: Option<String>,
    pub since_sequence: Option<u64>,
    pub offset: u64,
    pub limit: u64,
}

/// A log row to append; the repository assigns the row id.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub execution_id: ExecutionId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub node_id: Option<String>,
    pub agent_id: Option<String>,
    pub supervisor_id: Option<String>,
    pub message: String,
    pub extra_data: Option<serde_json::Value>,
}

/// Team persistence contract.
pub trait TeamRepo: Send + Sync + 'static {
    fn insert(&self, team: &Team) -> BoxFuture<'_, Result<()>>;

    fn get(&self, id: &TeamId) -> BoxFuture<'_, Result<Option<Team>>>;

    fn get_by_name(&self, name: &str) -> BoxFuture<'_, Result<Option<Team>>>;

    fn update(&self, team: &Team) -> BoxFuture<'_, Result<()>>;

    /// Returns false when the team did not exist.
    fn delete(&self, id: &TeamId) -> BoxFuture<'_, Result<bool>>;

    fn list(&self, offset: u64, limit: u64) -> BoxFuture<'_, Result<Vec<Team>>>;
}

/// Execution persistence contract.
pub trait ExecutionRepo: Send + Sync + 'static {
    fn insert(&self, execution: &Execution) -> BoxFuture<'_, Result<()>>;

    fn get(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>>;

    fn list(&self, filter: ExecutionFilter) -> BoxFuture<'_, Result<Vec<Execution>>>;

    /// PENDING → RUNNING with `started_at`.
    fn mark_running(
        &self,
        id: &ExecutionId,
        started_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Compare-and-swap RUNNING → `status` (terminal), stamping
    /// `completed_at`, `duration_ms`, and `error_message`. Returns true
    /// when this caller won the transition; false when the execution was
    /// already terminal (the caller must then read the winning status).
    fn try_finish(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Persist node results, aggregated output, and parse error without
    /// touching the status column. Safe after a lost terminal CAS.
    fn save_results(&self, execution: &Execution) -> BoxFuture<'_, Result<()>>;

    /// True when the team has an execution in RUNNING status.
    fn has_running_for_team(&self, team_id: &TeamId) -> BoxFuture<'_, Result<bool>>;

    /// Startup recovery: rewrite all PENDING/RUNNING rows to FAILED with
    /// the given reason, in one transaction. Returns the number swept.
    fn sweep_incomplete(&self, reason: &str) -> BoxFuture<'_, Result<u64>>;

    /// Retention: delete executions (and their logs) created before the
    /// cutoff. Terminal statuses only. Returns executions deleted.
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>>;
}

/// Execution log persistence contract.
pub trait ExecutionLogRepo: Send + Sync + 'static {
    fn append(&self, entry: &NewLogEntry) -> BoxFuture<'_, Result<()>>;

    /// Rows with `after < sequence < before`, ascending. Used for
    /// replay-then-live attachment.
    fn range(
        &self,
        execution_id: &ExecutionId,
        after: u64,
        before: u64,
    ) -> BoxFuture<'_, Result<Vec<ExecutionLog>>>;

    fn query(
        &self,
        execution_id: &ExecutionId,
        filter: LogFilter,
    ) -> BoxFuture<'_, Result<Vec<ExecutionLog>>>;

    /// Highest sequence persisted for the execution (0 when none).
    fn last_sequence(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<u64>>;
}

#[cfg(test)]
pub mod tests_support {
    use super::*;

    /// A registry that resolves nothing.
    pub struct NoModels;

    impl ModelRegistry for NoModels {
        fn resolve(&self, _provider: &str, _model_id: &str) -> Option<Arc<dyn LlmClient>> {
            None
        }
    }

    /// A tool source with no tools.
    pub struct EmptyTools;

    impl ToolSource for EmptyTools {
        fn lookup(&self, _name: &str) -> Option<Arc<dyn Tool>> {
            None
        }
    }
}
