use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::ExecutionRepo;

/// Deletes expired executions (and their logs) on a cron schedule.
/// In-progress executions are never eligible; the startup sweep has
/// already retired anything stale.
pub struct RetentionSweeper {
    executions: Arc<dyn ExecutionRepo>,
    schedule: Schedule,
    retention_days: u32,
    cancel: CancellationToken,
}

impl RetentionSweeper {
    pub fn new(
        executions: Arc<dyn ExecutionRepo>,
        cron_expr: &str,
        retention_days: u32,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let schedule = Schedule::from_str(cron_expr)
            .map_err(|e| TroupeError::Config(format!("invalid retention cron '{cron_expr}': {e}")))?;
        Ok(Self {
            executions,
            schedule,
            retention_days,
            cancel,
        })
    }

    /// Run the sweeper loop. Blocks until cancelled.
    pub async fn run(&self) {
        info!(
            retention_days = self.retention_days,
            "retention sweeper started"
        );

        loop {
            let Some(fire_at) = self.schedule.upcoming(Utc).next() else {
                warn!("retention schedule has no upcoming firings, sweeper idle");
                self.cancel.cancelled().await;
                return;
            };
            let delay = (fire_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(1));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    match self.sweep_now().await {
                        Ok(deleted) if deleted > 0 => {
                            info!(deleted, "retention sweep removed expired executions");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "retention sweep failed"),
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("retention sweeper shutting down");
                    return;
                }
            }
        }
    }

    /// One sweep, immediately. Idempotent: a second pass over an
    /// unchanged dataset deletes nothing.
    pub async fn sweep_now(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days as i64);
        self.executions.delete_older_than(cutoff).await
    }
}
