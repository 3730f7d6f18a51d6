use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::topology::TopologyConfig;

/// Unique team identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TeamId(pub String);

impl TeamId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for TeamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Team lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TeamStatus {
    Active,
    Inactive,
    Error,
}

impl std::fmt::Display for TeamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TeamStatus::Active => "ACTIVE",
            TeamStatus::Inactive => "INACTIVE",
            TeamStatus::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TeamStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(TeamStatus::Active),
            "INACTIVE" => Ok(TeamStatus::Inactive),
            "ERROR" => Ok(TeamStatus::Error),
            other => Err(format!("unknown team status: {other}")),
        }
    }
}

/// A named, validated topology blueprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: TeamStatus,
    pub timeout_seconds: u64,
    pub max_iterations: u32,
    pub topology: TopologyConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
pub const MAX_TIMEOUT_SECONDS: u64 = 1800;
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;
pub const MAX_MAX_ITERATIONS: u32 = 200;

impl Team {
    pub fn new(name: impl Into<String>, topology: TopologyConfig) -> Self {
        let now = Utc::now();
        Self {
            id: TeamId::new(),
            name: name.into(),
            description: String::new(),
            status: TeamStatus::Active,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            topology,
            created_at: now,
            updated_at: now,
        }
    }

    /// Field-level checks that are independent of the topology graph.
    pub fn check_metadata(&self) -> Result<(), String> {
        if self.name.is_empty() || self.name.len() > 200 {
            return Err("team name must be 1-200 characters".into());
        }
        if self.timeout_seconds < 1 || self.timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Err(format!(
                "timeout_seconds must be within 1-{MAX_TIMEOUT_SECONDS}"
            ));
        }
        if self.max_iterations < 1 || self.max_iterations > MAX_MAX_ITERATIONS {
            return Err(format!(
                "max_iterations must be within 1-{MAX_MAX_ITERATIONS}"
            ));
        }
        Ok(())
    }
}

/// Execution lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Timeout => "TIMEOUT",
            ExecutionStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "TIMEOUT" => Ok(ExecutionStatus::Timeout),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Per-node outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

/// Outcome of a single node in an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub status: NodeStatus,
    #[serde(default)]
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeResult {
    pub fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            output: String::new(),
            error: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Task plus free-form parameters supplied at trigger time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInput {
    pub task: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// Final aggregated result. `structured` is only present when an
/// output schema was supplied and validation succeeded; on exhausted
/// validation retries the raw text is kept and `parse_error` is set on
/// the execution instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
}

/// One run of a team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub team_id: TeamId,
    pub topology_snapshot: TopologyConfig,
    pub input: ExecutionInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<ExecutionOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    pub node_results: std::collections::HashMap<String, NodeResult>,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Execution {
    /// A fresh PENDING execution with all nodes in the snapshot seeded
    /// as PENDING results.
    pub fn pending(
        team_id: TeamId,
        snapshot: TopologyConfig,
        input: ExecutionInput,
        output_schema: Option<serde_json::Value>,
    ) -> Self {
        let node_results = snapshot
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeResult::pending()))
            .collect();
        Self {
            id: ExecutionId::new(),
            team_id,
            topology_snapshot: snapshot,
            input,
            output: None,
            output_schema,
            parse_error: None,
            node_results,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
        }
    }
}

/// Append-only ordered event record for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub execution_id: ExecutionId,
    /// Monotone per execution, starting at 1, gapless.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor_id: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<serde_json::Value>,
}
