use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use troupe_core::chat::{ChatMessage, CompletionRequest};
use troupe_core::error::{Result, TroupeError};
use troupe_core::event::{preview, ExecutionEvent};
use troupe_core::topology::{CompiledGraph, CoordinationStrategy, NodeKind};
use troupe_core::traits::ModelRegistry;
use troupe_core::types::{Execution, NodeResult, NodeStatus};
use troupe_tools::ToolRegistry;

use crate::bus::ExecutionBus;
use crate::step::{complete_with_retry, AgentStep, StepInput};

/// How one DAG walk ended, before the manager maps it to a terminal
/// execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed { success: bool },
    Cancelled,
}

pub struct RunOutcome {
    pub node_results: HashMap<String, NodeResult>,
    /// Aggregated (or supervisor-synthesized) final output; present only
    /// on success.
    pub output: Option<String>,
    pub disposition: Disposition,
    /// First node failure, for the execution's error_message.
    pub first_error: Option<String>,
}

/// Per-supervisor dispatch constraint among its direct children.
/// Edges decide readiness; the gate only sequences already-ready
/// children.
enum Gate {
    /// PARALLEL / ADAPTIVE: no constraint.
    Free,
    /// SEQUENTIAL / ROUND_ROBIN / PRIORITY: one child at a time, in
    /// plan order.
    Ordered(Vec<usize>),
    /// HIERARCHICAL: a depth level must finish before the next starts.
    Leveled(Vec<Vec<usize>>),
}

/// Drives one execution through its topology snapshot.
pub struct GraphRunner {
    models: Arc<dyn ModelRegistry>,
    step: Arc<AgentStep>,
    bus: Arc<ExecutionBus>,
}

impl GraphRunner {
    pub fn new(
        models: Arc<dyn ModelRegistry>,
        tools: Arc<ToolRegistry>,
        bus: Arc<ExecutionBus>,
    ) -> Self {
        let step = Arc::new(AgentStep::new(models.clone(), tools, bus.clone()));
        Self { models, step, bus }
    }

    pub async fn run(
        &self,
        execution: &Execution,
        graph: &CompiledGraph,
        max_iterations: u32,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let n = graph.len();
        let mut results: Vec<NodeResult> = (0..n).map(|_| NodeResult::pending()).collect();
        let mut gates: HashMap<usize, Gate> = HashMap::new();
        let mut tasks: JoinSet<(usize, Result<crate::step::StepOutcome>)> = JoinSet::new();
        let mut node_start: Vec<Option<Instant>> = vec![None; n];
        let mut first_error: Option<String> = None;
        let mut cancelled = false;

        info!(execution_id = %execution.id, nodes = n, "graph run started");

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            // Dispatch everything ready and admitted; supervisors
            // complete synchronously and may unlock further dispatch.
            loop {
                let dispatchable: Vec<usize> = (0..n)
                    .filter(|&i| {
                        results[i].status == NodeStatus::Pending
                            && self.ready(graph, &results, i)
                            && admitted(graph, &gates, &results, i)
                    })
                    .collect();
                if dispatchable.is_empty() {
                    break;
                }

                for idx in dispatchable {
                    let node = graph.node(idx);
                    self.bus
                        .publish(
                            &execution.id,
                            ExecutionEvent::NodeEntered {
                                node_id: node.id.clone(),
                            },
                        )
                        .await?;
                    results[idx].started_at = Some(Utc::now());

                    if node.kind.is_supervisor() {
                        self.complete_supervisor(execution, graph, idx, &mut results, &mut gates)
                            .await?;
                    } else {
                        results[idx].status = NodeStatus::Running;
                        node_start[idx] = Some(Instant::now());
                        self.spawn_step(execution, graph, idx, &results, max_iterations, cancel, &mut tasks);
                    }
                }
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                _ = cancel.cancelled() => continue,
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else { continue };
            let (idx, step_result) = joined.map_err(|e| {
                error!(error = %e, "node task panicked");
                TroupeError::LlmRequest(format!("node task panicked: {e}"))
            })?;

            let elapsed_ms = node_start[idx]
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or(0);
            let node_id = graph.id(idx).to_string();

            match step_result {
                Ok(outcome) => {
                    results[idx].status = NodeStatus::Success;
                    results[idx].output = outcome.output;
                    results[idx].attempts = outcome.attempts;
                    results[idx].completed_at = Some(Utc::now());
                    self.bus
                        .publish(
                            &execution.id,
                            ExecutionEvent::NodeCompleted {
                                node_id,
                                output_preview: preview(&results[idx].output, 200),
                                elapsed_ms,
                            },
                        )
                        .await?;
                }
                Err(TroupeError::Cancelled) => {
                    self.mark_skipped(execution, &mut results, idx, &node_id, "cancelled")
                        .await?;
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(execution_id = %execution.id, node_id = %node_id, error = %message, "node failed");
                    results[idx].status = NodeStatus::Failed;
                    results[idx].error = Some(message.clone());
                    results[idx].attempts = results[idx].attempts.max(1);
                    results[idx].completed_at = Some(Utc::now());
                    if first_error.is_none() {
                        first_error = Some(format!("node {node_id}: {message}"));
                    }
                    self.bus
                        .publish(
                            &execution.id,
                            ExecutionEvent::NodeFailed {
                                node_id: node_id.clone(),
                                error: message,
                            },
                        )
                        .await?;

                    // Skip propagation: nothing downstream of a failed
                    // node is ever dispatched.
                    let reason = format!("upstream failed: {node_id}");
                    for descendant in graph.descendants(idx) {
                        if results[descendant].status == NodeStatus::Pending {
                            let id = graph.id(descendant).to_string();
                            self.mark_skipped(execution, &mut results, descendant, &id, &reason)
                                .await?;
                        }
                    }
                }
            }
        }

        if cancelled {
            tasks.shutdown().await;
            for idx in 0..n {
                if !results[idx].status.is_terminal() {
                    let id = graph.id(idx).to_string();
                    self.mark_skipped(execution, &mut results, idx, &id, "cancelled")
                        .await?;
                }
            }
            return Ok(RunOutcome {
                node_results: into_map(graph, results),
                output: None,
                disposition: Disposition::Cancelled,
                first_error,
            });
        }

        let success = results.iter().all(|r| {
            matches!(r.status, NodeStatus::Success | NodeStatus::Skipped)
        }) && !results.iter().any(|r| r.status == NodeStatus::Failed)
            && graph
                .terminals
                .iter()
                .any(|&t| results[t].status == NodeStatus::Success);

        let output = if success {
            Some(
                self.aggregate(execution, graph, &results, cancel)
                    .await?,
            )
        } else {
            None
        };

        info!(execution_id = %execution.id, success, "graph run finished");
        Ok(RunOutcome {
            node_results: into_map(graph, results),
            output,
            disposition: Disposition::Completed { success },
            first_error,
        })
    }

    /// All predecessors SUCCESS. SKIPPED and FAILED predecessors
    /// permanently block a node; skip propagation retires it instead.
    fn ready(&self, graph: &CompiledGraph, results: &[NodeResult], idx: usize) -> bool {
        graph.predecessors[idx]
            .iter()
            .all(|&p| results[p].status == NodeStatus::Success)
    }

    async fn complete_supervisor(
        &self,
        execution: &Execution,
        graph: &CompiledGraph,
        idx: usize,
        results: &mut [NodeResult],
        gates: &mut HashMap<usize, Gate>,
    ) -> Result<()> {
        let node = graph.node(idx);
        let strategy = node.strategy();
        let (order, gate) = dispatch_plan(graph, idx, strategy);

        debug!(
            execution_id = %execution.id,
            supervisor_id = %node.id,
            ?strategy,
            "supervisor dispatch plan"
        );
        self.bus
            .publish(
                &execution.id,
                ExecutionEvent::SupervisorDecision {
                    supervisor_id: node.id.clone(),
                    strategy,
                    order: order.iter().map(|&c| graph.id(c).to_string()).collect(),
                },
            )
            .await?;
        gates.insert(idx, gate);

        results[idx].status = NodeStatus::Success;
        results[idx].completed_at = Some(Utc::now());
        self.bus
            .publish(
                &execution.id,
                ExecutionEvent::NodeCompleted {
                    node_id: node.id.clone(),
                    output_preview: String::new(),
                    elapsed_ms: 0,
                },
            )
            .await?;
        Ok(())
    }

    fn spawn_step(
        &self,
        execution: &Execution,
        graph: &CompiledGraph,
        idx: usize,
        results: &[NodeResult],
        max_iterations: u32,
        cancel: &CancellationToken,
        tasks: &mut JoinSet<(usize, Result<crate::step::StepOutcome>)>,
    ) {
        // Direct predecessor outputs in topological order, supervisors'
        // empty outputs filtered out.
        let upstream: Vec<(String, String)> = graph
            .topo_order
            .iter()
            .copied()
            .filter(|p| graph.predecessors[idx].contains(p))
            .filter(|&p| !results[p].output.is_empty())
            .map(|p| (graph.id(p).to_string(), results[p].output.clone()))
            .collect();

        let step = self.step.clone();
        let execution_id = execution.id.clone();
        let node = graph.node(idx).clone();
        let task = execution.input.task.clone();
        let parameters = execution.input.parameters.clone();
        let cancel = cancel.clone();

        tasks.spawn(async move {
            let input = StepInput {
                execution_id: &execution_id,
                node: &node,
                task: &task,
                parameters: &parameters,
                upstream,
                max_iterations,
            };
            let result = step.run(input, &cancel).await;
            (idx, result)
        });
    }

    async fn mark_skipped(
        &self,
        execution: &Execution,
        results: &mut [NodeResult],
        idx: usize,
        node_id: &str,
        reason: &str,
    ) -> Result<()> {
        results[idx].status = NodeStatus::Skipped;
        results[idx].error = Some(reason.to_string());
        results[idx].completed_at = Some(Utc::now());
        self.bus
            .publish(
                &execution.id,
                ExecutionEvent::NodeSkipped {
                    node_id: node_id.to_string(),
                    reason: reason.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Terminal-node outputs in topological order; the global
    /// supervisor synthesizes the final answer from them when its model
    /// resolves, otherwise they are concatenated.
    async fn aggregate(
        &self,
        execution: &Execution,
        graph: &CompiledGraph,
        results: &[NodeResult],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let terminal_outputs: Vec<(String, String)> = graph
            .terminals
            .iter()
            .filter(|&&t| results[t].status == NodeStatus::Success)
            .map(|&t| (graph.id(t).to_string(), results[t].output.clone()))
            .collect();

        let concatenated = terminal_outputs
            .iter()
            .map(|(_, output)| output.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let entry = graph.node(graph.entry);
        if entry.kind != NodeKind::GlobalSupervisor {
            return Ok(concatenated);
        }
        let Some(client) = self
            .models
            .resolve(&entry.agent_config.provider, &entry.agent_config.model_id)
        else {
            debug!(
                execution_id = %execution.id,
                "supervisor model not registered, returning concatenated output"
            );
            return Ok(concatenated);
        };

        let results_text = terminal_outputs
            .iter()
            .map(|(id, output)| format!("[{id}]:\n{output}"))
            .collect::<Vec<_>>()
            .join("\n\n");
        let system = format!(
            "{}\n\nYou are synthesizing the results from your team.\n\
             Integrate all relevant findings, highlight key insights, provide \
             actionable conclusions, and note any conflicts between results.",
            entry.agent_config.instructions
        );
        let user = format!(
            "Original task: {}\n\nResults to synthesize:\n{results_text}",
            execution.input.task
        );

        let request = CompletionRequest {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: entry.agent_config.temperature,
            max_tokens: entry.agent_config.max_tokens,
            tools: Vec::new(),
        };
        let mut attempts = 0;
        let response = complete_with_retry(
            &*client,
            request,
            &execution.id,
            &entry.id,
            &self.bus,
            &mut attempts,
            cancel,
        )
        .await?;
        Ok(response.text)
    }
}

fn into_map(graph: &CompiledGraph, results: Vec<NodeResult>) -> HashMap<String, NodeResult> {
    results
        .into_iter()
        .enumerate()
        .map(|(idx, result)| (graph.id(idx).to_string(), result))
        .collect()
}

/// Chosen dispatch order for a supervisor's direct children, plus the
/// gate that enforces it.
fn dispatch_plan(
    graph: &CompiledGraph,
    supervisor: usize,
    strategy: CoordinationStrategy,
) -> (Vec<usize>, Gate) {
    let declared: Vec<usize> = graph.successors[supervisor].clone();

    match strategy {
        CoordinationStrategy::Parallel | CoordinationStrategy::Adaptive => {
            (declared, Gate::Free)
        }
        CoordinationStrategy::Sequential | CoordinationStrategy::RoundRobin => {
            (declared.clone(), Gate::Ordered(declared))
        }
        CoordinationStrategy::Priority => {
            let mut ordered = declared;
            // Descending priority; declaration order breaks ties.
            ordered.sort_by_key(|&c| {
                std::cmp::Reverse(
                    graph
                        .edge_priority
                        .get(&(supervisor, c))
                        .copied()
                        .unwrap_or(0),
                )
            });
            (ordered.clone(), Gate::Ordered(ordered))
        }
        CoordinationStrategy::Hierarchical => {
            let mut by_level: Vec<(usize, usize)> =
                declared.iter().map(|&c| (graph.depth[c], c)).collect();
            by_level.sort_by_key(|&(level, _)| level);
            let mut levels: Vec<Vec<usize>> = Vec::new();
            let mut current_level = None;
            for (level, child) in by_level {
                if current_level != Some(level) {
                    levels.push(Vec::new());
                    current_level = Some(level);
                }
                levels.last_mut().unwrap().push(child);
            }
            let order = levels.iter().flatten().copied().collect();
            (order, Gate::Leveled(levels))
        }
    }
}

/// A node is admitted only when every supervisor parent's gate allows
/// it right now.
fn admitted(
    graph: &CompiledGraph,
    gates: &HashMap<usize, Gate>,
    results: &[NodeResult],
    idx: usize,
) -> bool {
    graph.predecessors[idx].iter().all(|parent| {
        match gates.get(parent) {
            None | Some(Gate::Free) => true,
            Some(Gate::Ordered(order)) => {
                // One at a time: only the first non-terminal child may go.
                order
                    .iter()
                    .find(|&&c| !results[c].status.is_terminal())
                    .is_some_and(|&c| c == idx)
            }
            Some(Gate::Leveled(levels)) => levels
                .iter()
                .find(|level| level.iter().any(|&c| !results[c].status.is_terminal()))
                .is_some_and(|level| level.contains(&idx)),
        }
    })
}
