use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use troupe_core::error::TroupeError;
use troupe_core::redact::redact_value;
use troupe_core::topology::TopologyConfig;
use troupe_core::traits::{ExecutionFilter, LogFilter};
use troupe_core::types::{
    ExecutionId, ExecutionStatus, Team, TeamId, TeamStatus, MAX_MAX_ITERATIONS,
    MAX_TIMEOUT_SECONDS,
};
use troupe_engine::TriggerRequest;

use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Serialize and mask: nothing leaves the boundary unredacted.
fn redacted<T: serde::Serialize>(value: &T) -> ApiResult<Json<serde_json::Value>> {
    let raw = serde_json::to_value(value).map_err(TroupeError::from)?;
    Ok(Json(redact_value(&raw)))
}

// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "running_executions": state.manager.running_count(),
    }))
}

#[derive(Deserialize)]
pub struct CreateTeamBody {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub timeout_seconds: Option<u64>,
    pub max_iterations: Option<u32>,
    pub topology: TopologyConfig,
}

fn check_agent_configs(topology: &TopologyConfig) -> Result<(), TroupeError> {
    for node in &topology.nodes {
        let t = node.agent_config.temperature;
        if !(0.0..=2.0).contains(&t) {
            return Err(TroupeError::InvalidInput(format!(
                "node '{}': temperature {t} outside [0, 2]",
                node.id
            )));
        }
    }
    Ok(())
}

// POST /teams
pub async fn create_team(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTeamBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    check_agent_configs(&body.topology)?;

    let report = body
        .topology
        .validate(state.models.as_ref(), state.tools.as_ref());
    if !report.is_ok() {
        return Err(TroupeError::TopologyInvalid(report).into());
    }

    if state.teams.get_by_name(&body.name).await?.is_some() {
        return Err(TroupeError::Conflict(format!("team name '{}' already exists", body.name)).into());
    }

    let mut team = Team::new(body.name, body.topology);
    team.description = body.description;
    team.timeout_seconds = body
        .timeout_seconds
        .unwrap_or(state.config.default_execution_timeout_seconds)
        .clamp(1, MAX_TIMEOUT_SECONDS);
    if let Some(max_iterations) = body.max_iterations {
        team.max_iterations = max_iterations.clamp(1, MAX_MAX_ITERATIONS);
    }
    team.check_metadata().map_err(TroupeError::InvalidInput)?;

    state.teams.insert(&team).await?;
    info!(team_id = %team.id, name = %team.name, "team created");
    Ok((StatusCode::CREATED, redacted(&team)?))
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_limit() -> u64 {
    20
}

// GET /teams
pub async fn list_teams(
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let teams = state.teams.list(page.offset, page.limit.min(100)).await?;
    redacted(&serde_json::json!({ "teams": teams }))
}

// GET /teams/{id}
pub async fn get_team(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let team = require_team(&state, &TeamId::parse(&id)).await?;
    redacted(&team)
}

#[derive(Deserialize)]
pub struct PatchTeamBody {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<TeamStatus>,
    pub timeout_seconds: Option<u64>,
    pub max_iterations: Option<u32>,
    pub topology: Option<TopologyConfig>,
}

// PATCH /teams/{id}
pub async fn patch_team(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PatchTeamBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut team = require_team(&state, &TeamId::parse(&id)).await?;

    if let Some(name) = body.name {
        if name != team.name {
            if state.teams.get_by_name(&name).await?.is_some() {
                return Err(
                    TroupeError::Conflict(format!("team name '{name}' already exists")).into(),
                );
            }
            team.name = name;
        }
    }
    if let Some(description) = body.description {
        team.description = description;
    }
    if let Some(status) = body.status {
        team.status = status;
    }
    if let Some(timeout_seconds) = body.timeout_seconds {
        team.timeout_seconds = timeout_seconds.clamp(1, MAX_TIMEOUT_SECONDS);
    }
    if let Some(max_iterations) = body.max_iterations {
        team.max_iterations = max_iterations.clamp(1, MAX_MAX_ITERATIONS);
    }

    if let Some(topology) = body.topology {
        check_agent_configs(&topology)?;
        let report = topology.validate(state.models.as_ref(), state.tools.as_ref());
        if !report.is_ok() {
            // A re-save with a broken topology parks the team in ERROR
            // until a valid one arrives.
            team.status = TeamStatus::Error;
            state.teams.update(&team).await?;
            return Err(TroupeError::TopologyInvalid(report).into());
        }
        team.topology = topology;
        if team.status == TeamStatus::Error {
            team.status = TeamStatus::Active;
        }
    }

    team.check_metadata().map_err(TroupeError::InvalidInput)?;
    state.teams.update(&team).await?;
    redacted(&team)
}

// DELETE /teams/{id}
pub async fn delete_team(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let team_id = TeamId::parse(&id);
    require_team(&state, &team_id).await?;

    if state.executions.has_running_for_team(&team_id).await? {
        return Err(TroupeError::Conflict(
            "team has a running execution; cancel it before deleting".into(),
        )
        .into());
    }

    state.teams.delete(&team_id).await?;
    info!(team_id = %team_id, "team deleted");
    Ok(StatusCode::NO_CONTENT)
}

// POST /teams/{id}/validate — dry-run a proposed topology, or the
// stored one when the body is empty.
pub async fn validate_team(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<TopologyConfig>>,
) -> ApiResult<Json<serde_json::Value>> {
    let topology = match body {
        Some(Json(topology)) => topology,
        None => require_team(&state, &TeamId::parse(&id)).await?.topology,
    };
    let report = topology.validate(state.models.as_ref(), state.tools.as_ref());
    Ok(Json(serde_json::json!({
        "valid": report.is_ok(),
        "errors": report.errors,
    })))
}

#[derive(Deserialize)]
pub struct TriggerBody {
    pub task: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub output_schema: Option<serde_json::Value>,
    pub timeout_seconds: Option<u64>,
}

// POST /teams/{id}/executions
pub async fn trigger_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<TriggerBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let execution = state
        .manager
        .trigger(
            &TeamId::parse(&id),
            TriggerRequest {
                task: body.task,
                parameters: body.parameters,
                output_schema: body.output_schema,
                timeout_seconds: body.timeout_seconds,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, redacted(&execution)?))
}

#[derive(Deserialize)]
pub struct ExecutionListQuery {
    pub status: Option<ExecutionStatus>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

// GET /teams/{id}/executions
pub async fn list_team_executions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ExecutionListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let team_id = TeamId::parse(&id);
    require_team(&state, &team_id).await?;

    let executions = state
        .manager
        .list(ExecutionFilter {
            team_id: Some(team_id),
            status: query.status,
            created_after: query.started_after,
            created_before: query.started_before,
            offset: query.offset,
            limit: query.limit,
        })
        .await?;
    redacted(&serde_json::json!({ "executions": executions }))
}

// GET /executions/{id}
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let execution = state.manager.get(&ExecutionId::parse(&id)).await?;
    redacted(&execution)
}

// POST /executions/{id}/cancel
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.manager.cancel(&ExecutionId::parse(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct LogQuery {
    pub event_type: Option<String>,
    pub node_id: Option<String>,
    pub since_sequence: Option<u64>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_log_limit")]
    pub limit: u64,
}

fn default_log_limit() -> u64 {
    100
}

// GET /executions/{id}/logs
pub async fn get_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let execution_id = ExecutionId::parse(&id);
    // 404 for unknown executions rather than an empty page.
    state.manager.get(&execution_id).await?;

    let logs = state
        .logs
        .query(
            &execution_id,
            LogFilter {
                event_type: query.event_type,
                node_id: query.node_id,
                since_sequence: query.since_sequence,
                offset: query.offset,
                limit: query.limit,
            },
        )
        .await?;
    redacted(&serde_json::json!({ "logs": logs }))
}

async fn require_team(state: &AppState, team_id: &TeamId) -> Result<Team, ApiError> {
    Ok(state
        .teams
        .get(team_id)
        .await?
        .ok_or_else(|| TroupeError::NotFound {
            resource: "team",
            id: team_id.to_string(),
        })?)
}
