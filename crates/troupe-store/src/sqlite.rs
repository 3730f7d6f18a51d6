use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::{
    ExecutionFilter, ExecutionLogRepo, ExecutionRepo, LogFilter, NewLogEntry, TeamRepo,
};
use troupe_core::types::{
    Execution, ExecutionId, ExecutionInput, ExecutionLog, ExecutionOutput, ExecutionStatus, Team,
    TeamId, TeamStatus,
};

/// Deletion batch size for the retention sweep.
const RETENTION_BATCH: usize = 500;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS teams (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        timeout_seconds INTEGER NOT NULL,
        max_iterations INTEGER NOT NULL,
        topology TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        team_id TEXT NOT NULL,
        topology_snapshot TEXT NOT NULL,
        input TEXT NOT NULL,
        output TEXT,
        output_schema TEXT,
        parse_error TEXT,
        node_results TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        duration_ms INTEGER,
        error_message TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_executions_team_status_created
        ON executions(team_id, status, created_at DESC);

    CREATE TABLE IF NOT EXISTS execution_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        execution_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        event_type TEXT NOT NULL,
        node_id TEXT,
        agent_id TEXT,
        supervisor_id TEXT,
        message TEXT NOT NULL DEFAULT '',
        extra_data TEXT,
        UNIQUE(execution_id, sequence)
    );

    CREATE INDEX IF NOT EXISTS idx_logs_execution_sequence
        ON execution_logs(execution_id, sequence);
";

/// SQLite-backed store implementing all three repository contracts.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open the database connection without touching the schema.
    pub fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    TroupeError::Database(format!("failed to create db directory: {e}"))
                })?;
            }
        }

        let conn =
            Connection::open(path).map_err(|e| TroupeError::Database(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| TroupeError::Database(e.to_string()))?;

        debug!(path = %path.display(), "sqlite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create or update the schema. Separated from `connect` so the
    /// binary can distinguish an unreachable store from a failed
    /// migration.
    pub fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(SCHEMA)
            .map_err(|e| TroupeError::Database(e.to_string()))
    }

    /// Open or create a database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self::connect(path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| TroupeError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TroupeError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TroupeError::Database(format!("connection mutex poisoned: {e}")))
    }
}

fn db_err(e: rusqlite::Error) -> TroupeError {
    if let rusqlite::Error::SqliteFailure(code, _) = &e {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return TroupeError::Conflict(e.to_string());
        }
    }
    TroupeError::Database(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TroupeError::Database(format!("bad timestamp '{raw}': {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_ts).transpose()
}

fn team_from_row(row: &Row<'_>) -> rusqlite::Result<(Team, String, String, String)> {
    let topology_json: String = row.get("topology")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let team = Team {
        id: TeamId(row.get("id")?),
        name: row.get("name")?,
        description: row.get("description")?,
        status: TeamStatus::Active, // fixed up by the caller
        timeout_seconds: row.get::<_, i64>("timeout_seconds")? as u64,
        max_iterations: row.get::<_, i64>("max_iterations")? as u32,
        topology: serde_json::from_str(&topology_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?,
        created_at: Utc::now(), // fixed up by the caller
        updated_at: Utc::now(),
    };
    Ok((team, status, created_at, updated_at))
}

fn finish_team((mut team, status, created_at, updated_at): (Team, String, String, String)) -> Result<Team> {
    team.status = status
        .parse()
        .map_err(TroupeError::Database)?;
    team.created_at = parse_ts(created_at)?;
    team.updated_at = parse_ts(updated_at)?;
    Ok(team)
}

struct ExecutionRow {
    id: String,
    team_id: String,
    topology_snapshot: String,
    input: String,
    output: Option<String>,
    output_schema: Option<String>,
    parse_error: Option<String>,
    node_results: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    error_message: Option<String>,
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRow> {
    Ok(ExecutionRow {
        id: row.get("id")?,
        team_id: row.get("team_id")?,
        topology_snapshot: row.get("topology_snapshot")?,
        input: row.get("input")?,
        output: row.get("output")?,
        output_schema: row.get("output_schema")?,
        parse_error: row.get("parse_error")?,
        node_results: row.get("node_results")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        duration_ms: row.get("duration_ms")?,
        error_message: row.get("error_message")?,
    })
}

fn finish_execution(row: ExecutionRow) -> Result<Execution> {
    let input: ExecutionInput = serde_json::from_str(&row.input)?;
    let output: Option<ExecutionOutput> = row
        .output
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    let output_schema: Option<serde_json::Value> = row
        .output_schema
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    Ok(Execution {
        id: ExecutionId(row.id),
        team_id: TeamId(row.team_id),
        topology_snapshot: serde_json::from_str(&row.topology_snapshot)?,
        input,
        output,
        output_schema,
        parse_error: row.parse_error,
        node_results: serde_json::from_str(&row.node_results)?,
        status: row.status.parse().map_err(TroupeError::Database)?,
        created_at: parse_ts(row.created_at)?,
        started_at: parse_opt_ts(row.started_at)?,
        completed_at: parse_opt_ts(row.completed_at)?,
        duration_ms: row.duration_ms.map(|d| d as u64),
        error_message: row.error_message,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<(ExecutionLog, String, Option<String>)> {
    let extra: Option<String> = row.get("extra_data")?;
    let log = ExecutionLog {
        id: row.get("id")?,
        execution_id: ExecutionId(row.get("execution_id")?),
        sequence: row.get::<_, i64>("sequence")? as u64,
        timestamp: Utc::now(), // fixed up by the caller
        event_type: row.get("event_type")?,
        node_id: row.get("node_id")?,
        agent_id: row.get("agent_id")?,
        supervisor_id: row.get("supervisor_id")?,
        message: row.get("message")?,
        extra_data: None,
    };
    let timestamp: String = row.get("timestamp")?;
    Ok((log, timestamp, extra))
}

fn finish_log((mut log, timestamp, extra): (ExecutionLog, String, Option<String>)) -> Result<ExecutionLog> {
    log.timestamp = parse_ts(timestamp)?;
    log.extra_data = extra.as_deref().map(serde_json::from_str).transpose()?;
    Ok(log)
}

impl TeamRepo for SqliteStore {
    fn insert(&self, team: &Team) -> BoxFuture<'_, Result<()>> {
        let team = team.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO teams (id, name, description, status, timeout_seconds,
                    max_iterations, topology, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    team.id.0,
                    team.name,
                    team.description,
                    team.status.to_string(),
                    team.timeout_seconds as i64,
                    team.max_iterations as i64,
                    to_json(&team.topology)?,
                    team.created_at.to_rfc3339(),
                    team.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get(&self, id: &TeamId) -> BoxFuture<'_, Result<Option<Team>>> {
        let id = id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let row = conn
                .query_row("SELECT * FROM teams WHERE id = ?1", params![id.0], team_from_row)
                .optional()
                .map_err(db_err)?;
            row.map(finish_team).transpose()
        })
    }

    fn get_by_name(&self, name: &str) -> BoxFuture<'_, Result<Option<Team>>> {
        let name = name.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let row = conn
                .query_row(
                    "SELECT * FROM teams WHERE name = ?1",
                    params![name],
                    team_from_row,
                )
                .optional()
                .map_err(db_err)?;
            row.map(finish_team).transpose()
        })
    }

    fn update(&self, team: &Team) -> BoxFuture<'_, Result<()>> {
        let team = team.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE teams SET name = ?2, description = ?3, status = ?4,
                        timeout_seconds = ?5, max_iterations = ?6, topology = ?7,
                        updated_at = ?8
                     WHERE id = ?1",
                    params![
                        team.id.0,
                        team.name,
                        team.description,
                        team.status.to_string(),
                        team.timeout_seconds as i64,
                        team.max_iterations as i64,
                        to_json(&team.topology)?,
                        Utc::now().to_rfc3339(),
                    ],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(TroupeError::NotFound {
                    resource: "team",
                    id: team.id.to_string(),
                });
            }
            Ok(())
        })
    }

    fn delete(&self, id: &TeamId) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute("DELETE FROM teams WHERE id = ?1", params![id.0])
                .map_err(db_err)?;
            Ok(changed > 0)
        })
    }

    fn list(&self, offset: u64, limit: u64) -> BoxFuture<'_, Result<Vec<Team>>> {
        Box::pin(async move {
            let limit = limit.clamp(1, 100);
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM teams ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![limit as i64, offset as i64], team_from_row)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter().map(finish_team).collect()
        })
    }
}

impl ExecutionRepo for SqliteStore {
    fn insert(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO executions (id, team_id, topology_snapshot, input, output,
                    output_schema, parse_error, node_results, status, created_at,
                    started_at, completed_at, duration_ms, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    execution.id.0,
                    execution.team_id.0,
                    to_json(&execution.topology_snapshot)?,
                    to_json(&execution.input)?,
                    execution.output.as_ref().map(to_json).transpose()?,
                    execution.output_schema.as_ref().map(to_json).transpose()?,
                    execution.parse_error,
                    to_json(&execution.node_results)?,
                    execution.status.to_string(),
                    execution.created_at.to_rfc3339(),
                    execution.started_at.map(|t| t.to_rfc3339()),
                    execution.completed_at.map(|t| t.to_rfc3339()),
                    execution.duration_ms.map(|d| d as i64),
                    execution.error_message,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let row = conn
                .query_row(
                    "SELECT * FROM executions WHERE id = ?1",
                    params![id.0],
                    execution_from_row,
                )
                .optional()
                .map_err(db_err)?;
            row.map(finish_execution).transpose()
        })
    }

    fn list(&self, filter: ExecutionFilter) -> BoxFuture<'_, Result<Vec<Execution>>> {
        Box::pin(async move {
            let mut sql = String::from("SELECT * FROM executions WHERE 1=1");
            let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(team_id) = &filter.team_id {
                sql.push_str(" AND team_id = ?");
                binds.push(Box::new(team_id.0.clone()));
            }
            if let Some(status) = filter.status {
                sql.push_str(" AND status = ?");
                binds.push(Box::new(status.to_string()));
            }
            if let Some(after) = filter.created_after {
                sql.push_str(" AND created_at >= ?");
                binds.push(Box::new(after.to_rfc3339()));
            }
            if let Some(before) = filter.created_before {
                sql.push_str(" AND created_at <= ?");
                binds.push(Box::new(before.to_rfc3339()));
            }

            let limit = if filter.limit == 0 {
                20
            } else {
                filter.limit.min(100)
            };
            sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
            binds.push(Box::new(limit as i64));
            binds.push(Box::new(filter.offset as i64));

            let conn = self.lock()?;
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())),
                    execution_from_row,
                )
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter().map(finish_execution).collect()
        })
    }

    fn mark_running(
        &self,
        id: &ExecutionId,
        started_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<()>> {
        let id = id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE executions SET status = 'RUNNING', started_at = ?2
                     WHERE id = ?1 AND status = 'PENDING'",
                    params![id.0, started_at.to_rfc3339()],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(TroupeError::Conflict(format!(
                    "execution {id} is not PENDING"
                )));
            }
            Ok(())
        })
    }

    fn try_finish(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move {
            debug_assert!(status.is_terminal(), "try_finish takes terminal statuses only");
            let conn = self.lock()?;
            let started_at: Option<Option<String>> = conn
                .query_row(
                    "SELECT started_at FROM executions WHERE id = ?1",
                    params![id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            let Some(started_at) = started_at else {
                return Err(TroupeError::NotFound {
                    resource: "execution",
                    id: id.to_string(),
                });
            };
            let duration_ms = started_at
                .map(parse_ts)
                .transpose()?
                .map(|s| (completed_at - s).num_milliseconds().max(0) as i64);

            let changed = conn
                .execute(
                    "UPDATE executions SET status = ?2, completed_at = ?3,
                        duration_ms = ?4, error_message = ?5
                     WHERE id = ?1 AND status = 'RUNNING'",
                    params![
                        id.0,
                        status.to_string(),
                        completed_at.to_rfc3339(),
                        duration_ms,
                        error_message,
                    ],
                )
                .map_err(db_err)?;
            Ok(changed == 1)
        })
    }

    fn save_results(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE executions SET node_results = ?2, output = ?3, parse_error = ?4
                 WHERE id = ?1",
                params![
                    execution.id.0,
                    to_json(&execution.node_results)?,
                    execution.output.as_ref().map(to_json).transpose()?,
                    execution.parse_error,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn has_running_for_team(&self, team_id: &TeamId) -> BoxFuture<'_, Result<bool>> {
        let team_id = team_id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM executions WHERE team_id = ?1 AND status = 'RUNNING'",
                    params![team_id.0],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(count > 0)
        })
    }

    fn sweep_incomplete(&self, reason: &str) -> BoxFuture<'_, Result<u64>> {
        let reason = reason.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE executions SET status = 'FAILED', error_message = ?1,
                        completed_at = ?2
                     WHERE status IN ('RUNNING', 'PENDING')",
                    params![reason, Utc::now().to_rfc3339()],
                )
                .map_err(db_err)?;
            Ok(changed as u64)
        })
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let cutoff = cutoff.to_rfc3339();
            let mut total = 0u64;
            loop {
                let mut conn = self.lock()?;
                let tx = conn.transaction().map_err(db_err)?;
                let ids: Vec<String> = {
                    let mut stmt = tx
                        .prepare(
                            "SELECT id FROM executions
                             WHERE created_at < ?1
                               AND status NOT IN ('RUNNING', 'PENDING')
                             LIMIT ?2",
                        )
                        .map_err(db_err)?;
                    let rows = stmt
                        .query_map(params![cutoff, RETENTION_BATCH as i64], |row| row.get(0))
                        .map_err(db_err)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                        .map_err(db_err)?;
                    rows
                };
                if ids.is_empty() {
                    break;
                }
                // Logs first, then the executions they belong to.
                for id in &ids {
                    tx.execute(
                        "DELETE FROM execution_logs WHERE execution_id = ?1",
                        params![id],
                    )
                    .map_err(db_err)?;
                    tx.execute("DELETE FROM executions WHERE id = ?1", params![id])
                        .map_err(db_err)?;
                }
                tx.commit().map_err(db_err)?;
                total += ids.len() as u64;
            }
            Ok(total)
        })
    }
}

impl ExecutionLogRepo for SqliteStore {
    fn append(&self, entry: &NewLogEntry) -> BoxFuture<'_, Result<()>> {
        let entry = entry.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO execution_logs (execution_id, sequence, timestamp, event_type,
                    node_id, agent_id, supervisor_id, message, extra_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.execution_id.0,
                    entry.sequence as i64,
                    entry.timestamp.to_rfc3339(),
                    entry.event_type,
                    entry.node_id,
                    entry.agent_id,
                    entry.supervisor_id,
                    entry.message,
                    entry.extra_data.as_ref().map(to_json).transpose()?,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn range(
        &self,
        execution_id: &ExecutionId,
        after: u64,
        before: u64,
    ) -> BoxFuture<'_, Result<Vec<ExecutionLog>>> {
        let execution_id = execution_id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM execution_logs
                     WHERE execution_id = ?1 AND sequence > ?2 AND sequence < ?3
                     ORDER BY sequence ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(
                    params![execution_id.0, after as i64, before as i64],
                    log_from_row,
                )
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter().map(finish_log).collect()
        })
    }

    fn query(
        &self,
        execution_id: &ExecutionId,
        filter: LogFilter,
    ) -> BoxFuture<'_, Result<Vec<ExecutionLog>>> {
        let execution_id = execution_id.clone();
        Box::pin(async move {
            let mut sql = String::from("SELECT * FROM execution_logs WHERE execution_id = ?");
            let mut binds: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(execution_id.0.clone())];

            if let Some(event_type) = &filter.event_type {
                sql.push_str(" AND event_type = ?");
                binds.push(Box::new(event_type.clone()));
            }
            if let Some(node_id) = &filter.node_id {
                sql.push_str(" AND node_id = ?");
                binds.push(Box::new(node_id.clone()));
            }
            if let Some(since) = filter.since_sequence {
                sql.push_str(" AND sequence > ?");
                binds.push(Box::new(since as i64));
            }

            let limit = if filter.limit == 0 {
                100
            } else {
                filter.limit.min(1000)
            };
            sql.push_str(" ORDER BY sequence ASC LIMIT ? OFFSET ?");
            binds.push(Box::new(limit as i64));
            binds.push(Box::new(filter.offset as i64));

            let conn = self.lock()?;
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())),
                    log_from_row,
                )
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter().map(finish_log).collect()
        })
    }

    fn last_sequence(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<u64>> {
        let execution_id = execution_id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let max: Option<i64> = conn
                .query_row(
                    "SELECT MAX(sequence) FROM execution_logs WHERE execution_id = ?1",
                    params![execution_id.0],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(max.unwrap_or(0) as u64)
        })
    }
}
