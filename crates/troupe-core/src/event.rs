use serde::{Deserialize, Serialize};

use crate::topology::CoordinationStrategy;

/// Everything that can happen during one execution, in the order it
/// happened. Persisted to the execution log before any subscriber sees
/// it; `Heartbeat` is the one synthetic exception and is never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        team_id: String,
        task: String,
    },
    SupervisorDecision {
        supervisor_id: String,
        strategy: CoordinationStrategy,
        /// Child node ids in chosen dispatch order.
        order: Vec<String>,
    },
    NodeEntered {
        node_id: String,
    },
    NodeCompleted {
        node_id: String,
        output_preview: String,
        elapsed_ms: u64,
    },
    NodeFailed {
        node_id: String,
        error: String,
    },
    NodeSkipped {
        node_id: String,
        reason: String,
    },
    ToolCall {
        node_id: String,
        tool: String,
        input: serde_json::Value,
        /// Digest of the tool output; raw output stays in the step's
        /// reasoning context and out of the log.
        output_hash: String,
        duration_ms: u64,
    },
    LlmRetry {
        node_id: String,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    ExecutionCompleted {
        output_preview: String,
    },
    ExecutionFailed {
        error: String,
    },
    ExecutionTimeout {
        timeout_seconds: u64,
    },
    ExecutionCancelled {},
    Heartbeat {
        next_sequence: u64,
    },
}

impl ExecutionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ExecutionEvent::ExecutionStarted { .. } => "execution_started",
            ExecutionEvent::SupervisorDecision { .. } => "supervisor_decision",
            ExecutionEvent::NodeEntered { .. } => "node_entered",
            ExecutionEvent::NodeCompleted { .. } => "node_completed",
            ExecutionEvent::NodeFailed { .. } => "node_failed",
            ExecutionEvent::NodeSkipped { .. } => "node_skipped",
            ExecutionEvent::ToolCall { .. } => "tool_call",
            ExecutionEvent::LlmRetry { .. } => "llm_retry",
            ExecutionEvent::ExecutionCompleted { .. } => "execution_completed",
            ExecutionEvent::ExecutionFailed { .. } => "execution_failed",
            ExecutionEvent::ExecutionTimeout { .. } => "execution_timeout",
            ExecutionEvent::ExecutionCancelled {} => "execution_cancelled",
            ExecutionEvent::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Terminal events close the execution's log; exactly one is
    /// published per execution and it is always last.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::ExecutionCompleted { .. }
                | ExecutionEvent::ExecutionFailed { .. }
                | ExecutionEvent::ExecutionTimeout { .. }
                | ExecutionEvent::ExecutionCancelled {}
        )
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::NodeEntered { node_id }
            | ExecutionEvent::NodeCompleted { node_id, .. }
            | ExecutionEvent::NodeFailed { node_id, .. }
            | ExecutionEvent::NodeSkipped { node_id, .. }
            | ExecutionEvent::ToolCall { node_id, .. }
            | ExecutionEvent::LlmRetry { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    pub fn supervisor_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::SupervisorDecision { supervisor_id, .. } => Some(supervisor_id),
            _ => None,
        }
    }

    /// One-line human summary for the log row.
    pub fn message(&self) -> String {
        match self {
            ExecutionEvent::ExecutionStarted { task, .. } => {
                format!("execution started: {}", preview(task, 120))
            }
            ExecutionEvent::SupervisorDecision {
                supervisor_id,
                strategy,
                order,
            } => format!(
                "supervisor {supervisor_id} dispatching {:?} via {strategy:?}",
                order
            ),
            ExecutionEvent::NodeEntered { node_id } => format!("node {node_id} entered"),
            ExecutionEvent::NodeCompleted { node_id, elapsed_ms, .. } => {
                format!("node {node_id} completed in {elapsed_ms}ms")
            }
            ExecutionEvent::NodeFailed { node_id, error } => {
                format!("node {node_id} failed: {}", preview(error, 200))
            }
            ExecutionEvent::NodeSkipped { node_id, reason } => {
                format!("node {node_id} skipped: {reason}")
            }
            ExecutionEvent::ToolCall { node_id, tool, duration_ms, .. } => {
                format!("node {node_id} called tool {tool} ({duration_ms}ms)")
            }
            ExecutionEvent::LlmRetry { node_id, attempt, backoff_ms, .. } => {
                format!("node {node_id} retrying LLM call (attempt {attempt}, backoff {backoff_ms}ms)")
            }
            ExecutionEvent::ExecutionCompleted { .. } => "execution completed".into(),
            ExecutionEvent::ExecutionFailed { error } => {
                format!("execution failed: {}", preview(error, 200))
            }
            ExecutionEvent::ExecutionTimeout { timeout_seconds } => {
                format!("execution timed out after {timeout_seconds}s")
            }
            ExecutionEvent::ExecutionCancelled {} => "execution cancelled".into(),
            ExecutionEvent::Heartbeat { next_sequence } => {
                format!("heartbeat (next sequence {next_sequence})")
            }
        }
    }
}

/// Truncate long payload text for log messages and previews.
pub fn preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(ExecutionEvent::ExecutionCompleted {
            output_preview: "".into()
        }
        .is_terminal());
        assert!(ExecutionEvent::ExecutionCancelled {}.is_terminal());
        assert!(!ExecutionEvent::NodeEntered { node_id: "a".into() }.is_terminal());
        assert!(!ExecutionEvent::Heartbeat { next_sequence: 3 }.is_terminal());
    }

    #[test]
    fn serializes_with_snake_case_tag() {
        let event = ExecutionEvent::NodeFailed {
            node_id: "a1".into(),
            error: "boom".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "node_failed");
        assert_eq!(value["node_id"], "a1");
        assert_eq!(event.event_type(), "node_failed");
    }

    #[test]
    fn preview_truncates() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdefghij", 4), "abcd...");
    }
}
