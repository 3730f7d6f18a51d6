use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use troupe_core::error::{Result, TroupeError};
use troupe_core::event::{preview, ExecutionEvent};
use troupe_core::topology::CompiledGraph;
use troupe_core::traits::{ExecutionFilter, ExecutionRepo, ModelRegistry, TeamRepo};
use troupe_core::types::{
    Execution, ExecutionId, ExecutionInput, ExecutionOutput, ExecutionStatus, Team, TeamId,
    TeamStatus, MAX_TIMEOUT_SECONDS,
};
use troupe_tools::ToolRegistry;

use crate::bus::ExecutionBus;
use crate::runner::{Disposition, GraphRunner};
use crate::structured;

/// A trigger request, as accepted at the API boundary.
#[derive(Debug, Clone, Default)]
pub struct TriggerRequest {
    pub task: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub output_schema: Option<serde_json::Value>,
    pub timeout_seconds: Option<u64>,
}

struct RunningHandle {
    cancel: CancellationToken,
}

/// Admits, launches, tracks, cancels, and times out executions. Owns
/// the process-wide admission semaphore and the in-flight table.
pub struct ExecutionManager {
    teams: Arc<dyn TeamRepo>,
    executions: Arc<dyn ExecutionRepo>,
    bus: Arc<ExecutionBus>,
    models: Arc<dyn ModelRegistry>,
    tools: Arc<ToolRegistry>,
    runner: Arc<GraphRunner>,
    semaphore: Arc<Semaphore>,
    running: Mutex<HashMap<ExecutionId, RunningHandle>>,
    limit: usize,
}

impl ExecutionManager {
    pub fn new(
        teams: Arc<dyn TeamRepo>,
        executions: Arc<dyn ExecutionRepo>,
        bus: Arc<ExecutionBus>,
        models: Arc<dyn ModelRegistry>,
        tools: Arc<ToolRegistry>,
        limit: usize,
    ) -> Arc<Self> {
        let runner = Arc::new(GraphRunner::new(models.clone(), tools.clone(), bus.clone()));
        Arc::new(Self {
            teams,
            executions,
            bus,
            models,
            tools,
            runner,
            semaphore: Arc::new(Semaphore::new(limit)),
            running: Mutex::new(HashMap::new()),
            limit,
        })
    }

    /// Startup reconciliation: every PENDING/RUNNING row left over from
    /// a previous process is rewritten to FAILED before the API opens.
    pub async fn recover(executions: &dyn ExecutionRepo) -> Result<u64> {
        let swept = executions.sweep_incomplete("host restart").await?;
        if swept > 0 {
            warn!(swept, "marked stale executions FAILED after restart");
        }
        Ok(swept)
    }

    /// Number of executions currently tracked in-flight.
    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    /// Admit and launch a new execution for a team.
    pub async fn trigger(
        self: &Arc<Self>,
        team_id: &TeamId,
        request: TriggerRequest,
    ) -> Result<Execution> {
        if request.task.trim().is_empty() {
            return Err(TroupeError::InvalidInput("task must not be empty".into()));
        }

        let team = self
            .teams
            .get(team_id)
            .await?
            .ok_or_else(|| TroupeError::NotFound {
                resource: "team",
                id: team_id.to_string(),
            })?;
        if team.status != TeamStatus::Active {
            return Err(TroupeError::Conflict(format!(
                "team {} is {}, not ACTIVE",
                team.name, team.status
            )));
        }

        // Model and tool names may have been removed since the team was
        // saved; re-validate against the registries as they are now.
        let report = team
            .topology
            .validate(self.models.as_ref(), self.tools.as_ref());
        if !report.is_ok() {
            return Err(TroupeError::TopologyInvalid(report));
        }

        if self.executions.has_running_for_team(team_id).await? {
            return Err(TroupeError::Conflict(format!(
                "team {} already has a running execution",
                team.name
            )));
        }

        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| TroupeError::ConcurrencyLimitExceeded { limit: self.limit })?;

        let graph = team
            .topology
            .compile()
            .map_err(TroupeError::InvalidInput)?;

        let output_schema = request
            .output_schema
            .clone()
            .or_else(|| team.topology.output_schema.clone());
        let mut execution = Execution::pending(
            team_id.clone(),
            team.topology.clone(),
            ExecutionInput {
                task: request.task.clone(),
                parameters: request.parameters.clone(),
            },
            output_schema,
        );
        self.executions.insert(&execution).await?;
        self.bus.open(&execution.id);

        let started_at = Utc::now();
        self.executions
            .mark_running(&execution.id, started_at)
            .await?;
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(started_at);

        self.bus
            .publish(
                &execution.id,
                ExecutionEvent::ExecutionStarted {
                    team_id: team_id.to_string(),
                    task: request.task.clone(),
                },
            )
            .await?;

        let timeout_seconds = request
            .timeout_seconds
            .unwrap_or(team.timeout_seconds)
            .clamp(1, MAX_TIMEOUT_SECONDS);

        let cancel = CancellationToken::new();
        self.running.lock().unwrap().insert(
            execution.id.clone(),
            RunningHandle {
                cancel: cancel.clone(),
            },
        );

        info!(
            execution_id = %execution.id,
            team_id = %team_id,
            timeout_seconds,
            "execution admitted"
        );

        let manager = Arc::clone(self);
        let snapshot = execution.clone();
        tokio::spawn(async move {
            manager
                .supervise(snapshot, team, graph, timeout_seconds, cancel, permit)
                .await;
        });

        Ok(execution)
    }

    /// Run one execution to its terminal state under the watchdog. The
    /// semaphore permit is released exactly once: when this task drops
    /// it on every exit path.
    async fn supervise(
        self: Arc<Self>,
        mut execution: Execution,
        team: Team,
        graph: CompiledGraph,
        timeout_seconds: u64,
        cancel: CancellationToken,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let cancel = cancel.clone();
            let timed_out = timed_out.clone();
            let execution_id = execution.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(timeout_seconds)).await;
                warn!(execution_id = %execution_id, timeout_seconds, "watchdog fired");
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        };

        let run_result = self
            .runner
            .run(&execution, &graph, team.max_iterations, &cancel)
            .await;
        watchdog.abort();

        let mut error_message: Option<String> = None;
        let proposal = match run_result {
            Ok(outcome) => {
                execution.node_results = outcome.node_results;
                match outcome.disposition {
                    Disposition::Cancelled => self.cancelled_proposal(&timed_out),
                    Disposition::Completed { success: true } => {
                        let raw = outcome.output.unwrap_or_default();
                        match self.finish_output(&mut execution, &graph, raw, &cancel).await {
                            Ok(()) => ExecutionStatus::Success,
                            // Structured-output enforcement interrupted
                            // by cancel/timeout mid-flight.
                            Err(TroupeError::Cancelled) => self.cancelled_proposal(&timed_out),
                            Err(e) => {
                                error_message = Some(e.to_string());
                                ExecutionStatus::Failed
                            }
                        }
                    }
                    Disposition::Completed { success: false } => {
                        error_message = outcome
                            .first_error
                            .or_else(|| Some("one or more nodes failed".into()));
                        ExecutionStatus::Failed
                    }
                }
            }
            Err(TroupeError::Cancelled) => self.cancelled_proposal(&timed_out),
            Err(e) => {
                error!(execution_id = %execution.id, error = %e, "graph run errored");
                error_message = Some(e.to_string());
                ExecutionStatus::Failed
            }
        };
        if proposal == ExecutionStatus::Timeout {
            error_message = Some(format!("timeout after {timeout_seconds}s"));
        }

        if let Err(e) = self.executions.save_results(&execution).await {
            error!(execution_id = %execution.id, error = %e, "failed to persist node results");
        }

        let final_status = match self
            .executions
            .try_finish(&execution.id, proposal, Utc::now(), error_message.clone())
            .await
        {
            Ok(true) => proposal,
            Ok(false) => {
                // Someone else (cancel) won the terminal transition;
                // adopt the winning status for the terminal event.
                match self.executions.get(&execution.id).await {
                    Ok(Some(current)) => current.status,
                    _ => proposal,
                }
            }
            Err(e) => {
                error!(execution_id = %execution.id, error = %e, "terminal transition failed");
                proposal
            }
        };

        let terminal_event = match final_status {
            ExecutionStatus::Success => ExecutionEvent::ExecutionCompleted {
                output_preview: execution
                    .output
                    .as_ref()
                    .map(|o| preview(&o.raw, 200))
                    .unwrap_or_default(),
            },
            ExecutionStatus::Failed => ExecutionEvent::ExecutionFailed {
                error: error_message.unwrap_or_else(|| "execution failed".into()),
            },
            ExecutionStatus::Timeout => ExecutionEvent::ExecutionTimeout { timeout_seconds },
            ExecutionStatus::Cancelled => ExecutionEvent::ExecutionCancelled {},
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                unreachable!("terminal transition produced a non-terminal status")
            }
        };
        if let Err(e) = self.bus.publish(&execution.id, terminal_event).await {
            error!(execution_id = %execution.id, error = %e, "failed to publish terminal event");
        }

        self.running.lock().unwrap().remove(&execution.id);
        drop(permit);
        info!(execution_id = %execution.id, status = %final_status, "execution finished");
    }

    fn cancelled_proposal(&self, timed_out: &AtomicBool) -> ExecutionStatus {
        if timed_out.load(Ordering::SeqCst) {
            ExecutionStatus::Timeout
        } else {
            ExecutionStatus::Cancelled
        }
    }

    /// Attach the final output, enforcing the output schema when one
    /// was supplied. Schema failure is recoverable: the raw output and
    /// the parse error are both kept and the execution still succeeds.
    async fn finish_output(
        &self,
        execution: &mut Execution,
        graph: &CompiledGraph,
        raw: String,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(schema) = execution.output_schema.clone() else {
            execution.output = Some(ExecutionOutput {
                raw,
                structured: None,
            });
            return Ok(());
        };

        let entry = graph.node(graph.entry);
        let client = self
            .models
            .resolve(&entry.agent_config.provider, &entry.agent_config.model_id);
        let outcome = structured::enforce_schema(
            client,
            entry.agent_config.temperature,
            &schema,
            raw,
            cancel,
        )
        .await?;

        execution.output = Some(ExecutionOutput {
            raw: outcome.raw,
            structured: outcome.structured,
        });
        execution.parse_error = outcome.parse_error;
        Ok(())
    }

    /// Cancel a running execution: CAS the status, then trip the token
    /// so the background task unwinds cooperatively and publishes the
    /// terminal event.
    pub async fn cancel(&self, execution_id: &ExecutionId) -> Result<()> {
        let token = {
            let running = self.running.lock().unwrap();
            running.get(execution_id).map(|h| h.cancel.clone())
        };

        let Some(token) = token else {
            return match self.executions.get(execution_id).await? {
                None => Err(TroupeError::NotFound {
                    resource: "execution",
                    id: execution_id.to_string(),
                }),
                Some(_) => Err(TroupeError::ExecutionNotRunning(execution_id.to_string())),
            };
        };

        let won = self
            .executions
            .try_finish(execution_id, ExecutionStatus::Cancelled, Utc::now(), None)
            .await?;
        if !won {
            return Err(TroupeError::ExecutionNotRunning(execution_id.to_string()));
        }

        info!(execution_id = %execution_id, "execution cancelled by operator");
        token.cancel();
        Ok(())
    }

    pub async fn get(&self, execution_id: &ExecutionId) -> Result<Execution> {
        self.executions
            .get(execution_id)
            .await?
            .ok_or_else(|| TroupeError::NotFound {
                resource: "execution",
                id: execution_id.to_string(),
            })
    }

    pub async fn list(&self, filter: ExecutionFilter) -> Result<Vec<Execution>> {
        self.executions.list(filter).await
    }
}
