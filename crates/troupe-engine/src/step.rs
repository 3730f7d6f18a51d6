use std::hash::Hasher;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHasher;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use troupe_core::chat::{ChatMessage, CompletionRequest, CompletionResponse};
use troupe_core::error::{Result, TroupeError};
use troupe_core::event::ExecutionEvent;
use troupe_core::topology::NodeSpec;
use troupe_core::traits::{ModelRegistry, ToolContext};
use troupe_core::types::ExecutionId;
use troupe_tools::ToolRegistry;

use crate::bus::ExecutionBus;

/// Transient-failure backoff ladder: 1s, 2s, 4s — three retries, four
/// attempts total per LLM call.
pub const MAX_LLM_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1_000;

pub fn backoff_for_attempt(attempt: u32) -> Duration {
    Duration::from_millis(INITIAL_BACKOFF_MS << attempt)
}

/// Everything a single node run needs from its surroundings.
pub struct StepInput<'a> {
    pub execution_id: &'a ExecutionId,
    pub node: &'a NodeSpec,
    pub task: &'a str,
    pub parameters: &'a serde_json::Map<String, serde_json::Value>,
    /// `(node_id, output)` of completed upstream nodes, topological order.
    pub upstream: Vec<(String, String)>,
    pub max_iterations: u32,
}

/// Outcome of one node run.
pub struct StepOutcome {
    pub output: String,
    /// LLM call attempts, including transient retries.
    pub attempts: u32,
}

/// Executes a single node end-to-end: prompt assembly, the tool loop,
/// and transient-failure retries.
pub struct AgentStep {
    models: Arc<dyn ModelRegistry>,
    tools: Arc<ToolRegistry>,
    bus: Arc<ExecutionBus>,
}

impl AgentStep {
    pub fn new(
        models: Arc<dyn ModelRegistry>,
        tools: Arc<ToolRegistry>,
        bus: Arc<ExecutionBus>,
    ) -> Self {
        Self { models, tools, bus }
    }

    pub async fn run(&self, input: StepInput<'_>, cancel: &CancellationToken) -> Result<StepOutcome> {
        let config = &input.node.agent_config;
        let client = self
            .models
            .resolve(&config.provider, &config.model_id)
            .ok_or_else(|| TroupeError::UnknownModel {
                provider: config.provider.clone(),
                model_id: config.model_id.clone(),
            })?;

        let mut messages = vec![
            ChatMessage::system(&config.instructions),
            ChatMessage::user(build_user_prompt(&input)),
        ];
        let tool_defs = self.tools.definitions_for(&config.tools);

        let mut attempts = 0u32;
        let mut last_text = String::new();

        for iteration in 0..input.max_iterations {
            let request = CompletionRequest {
                messages: messages.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                tools: tool_defs.clone(),
            };

            let response = complete_with_retry(
                &*client,
                request,
                input.execution_id,
                &input.node.id,
                &self.bus,
                &mut attempts,
                cancel,
            )
            .await?;

            last_text = response.text.clone();
            if response.tool_calls.is_empty() {
                debug!(
                    node_id = %input.node.id,
                    iterations = iteration + 1,
                    attempts,
                    "node step finished"
                );
                return Ok(StepOutcome {
                    output: response.text,
                    attempts,
                });
            }

            self.run_tool_calls(&mut messages, response, &input, cancel)
                .await?;
        }

        // Iteration cap reached with tool calls still pending; the last
        // text response stands as the node's output.
        warn!(
            node_id = %input.node.id,
            max_iterations = input.max_iterations,
            "node hit its iteration cap"
        );
        Ok(StepOutcome {
            output: last_text,
            attempts,
        })
    }

    async fn run_tool_calls(
        &self,
        messages: &mut Vec<ChatMessage>,
        response: CompletionResponse,
        input: &StepInput<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Record the assistant turn so the model sees its own requests.
        let call_summary = response
            .tool_calls
            .iter()
            .map(|c| format!("{}({})", c.name, c.arguments))
            .collect::<Vec<_>>()
            .join(", ");
        messages.push(ChatMessage::assistant(if response.text.is_empty() {
            format!("[tool calls: {call_summary}]")
        } else {
            format!("{}\n[tool calls: {call_summary}]", response.text)
        }));

        for call in response.tool_calls {
            if cancel.is_cancelled() {
                return Err(TroupeError::Cancelled);
            }

            let started = Instant::now();
            let ctx = ToolContext {
                execution_id: input.execution_id.clone(),
                node_id: input.node.id.clone(),
            };
            // An unknown tool is a hard failure for the node.
            let output = tokio::select! {
                _ = cancel.cancelled() => return Err(TroupeError::Cancelled),
                result = self.tools.execute(&call.name, call.arguments.clone(), ctx) => result?,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            self.bus
                .publish(
                    input.execution_id,
                    ExecutionEvent::ToolCall {
                        node_id: input.node.id.clone(),
                        tool: call.name.clone(),
                        input: call.arguments,
                        output_hash: content_hash(&output.content),
                        duration_ms,
                    },
                )
                .await?;

            messages.push(ChatMessage::tool_result(
                call.id,
                if output.is_error {
                    format!("[tool error] {}", output.content)
                } else {
                    output.content
                },
            ));
        }
        Ok(())
    }
}

/// One LLM call under the transient-retry policy. Each retry publishes
/// an `llm_retry` event attributed to the calling node, and both the
/// request and the backoff sleep race the cancellation token.
pub(crate) async fn complete_with_retry(
    client: &dyn troupe_core::traits::LlmClient,
    request: CompletionRequest,
    execution_id: &ExecutionId,
    node_id: &str,
    bus: &Arc<ExecutionBus>,
    attempts: &mut u32,
    cancel: &CancellationToken,
) -> Result<CompletionResponse> {
    for retry in 0..=MAX_LLM_RETRIES {
        if cancel.is_cancelled() {
            return Err(TroupeError::Cancelled);
        }
        *attempts += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(TroupeError::Cancelled),
            result = client.complete(request.clone()) => result,
        };

        match result {
            Ok(response) => return Ok(response),
            Err(e) if e.is_transient() && retry < MAX_LLM_RETRIES => {
                let backoff = backoff_for_attempt(retry);
                bus.publish(
                    execution_id,
                    ExecutionEvent::LlmRetry {
                        node_id: node_id.to_string(),
                        attempt: retry + 1,
                        backoff_ms: backoff.as_millis() as u64,
                        error: e.to_string(),
                    },
                )
                .await?;
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TroupeError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop returns on success or final error")
}

/// Deterministic digest of a tool output, keeping raw payloads out of
/// the event log.
pub fn content_hash(content: &str) -> String {
    let mut hasher = FxHasher::default();
    hasher.write(content.as_bytes());
    format!("{:016x}", hasher.finish())
}

fn build_user_prompt(input: &StepInput<'_>) -> String {
    let mut prompt = format!("Task: {}", input.task);

    if !input.upstream.is_empty() {
        prompt.push_str("\n\nUpstream results:");
        for (node_id, output) in &input.upstream {
            prompt.push_str(&format!(
                "\n[{node_id}]:\n{}",
                troupe_core::event::preview(output, 2_000)
            ));
        }
    }

    if !input.parameters.is_empty() {
        prompt.push_str(&format!(
            "\n\nParameters: {}",
            serde_json::Value::Object(input.parameters.clone())
        ));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_core::topology::{AgentSpec, NodeKind};

    fn node() -> NodeSpec {
        NodeSpec {
            id: "a1".into(),
            name: "A1".into(),
            kind: NodeKind::Agent,
            agent_config: AgentSpec {
                role: "worker".into(),
                instructions: "do work".into(),
                provider: "mock".into(),
                model_id: "m1".into(),
                tools: vec![],
                temperature: 0.7,
                max_tokens: None,
            },
            coordination_strategy: None,
        }
    }

    #[test]
    fn backoff_ladder_is_1_2_4() {
        assert_eq!(backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 16);
    }

    #[test]
    fn user_prompt_includes_task_upstream_and_parameters() {
        let node = node();
        let execution_id = ExecutionId::new();
        let mut parameters = serde_json::Map::new();
        parameters.insert("region".into(), serde_json::json!("eu-west-1"));
        let input = StepInput {
            execution_id: &execution_id,
            node: &node,
            task: "diagnose the outage",
            parameters: &parameters,
            upstream: vec![("probe".into(), "latency is up".into())],
            max_iterations: 5,
        };
        let prompt = build_user_prompt(&input);
        assert!(prompt.contains("Task: diagnose the outage"));
        assert!(prompt.contains("[probe]:"));
        assert!(prompt.contains("latency is up"));
        assert!(prompt.contains("eu-west-1"));
    }
}
