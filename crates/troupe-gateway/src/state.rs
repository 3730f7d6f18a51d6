use std::sync::Arc;

use troupe_core::config::Config;
use troupe_core::traits::{ExecutionLogRepo, ExecutionRepo, ModelRegistry, TeamRepo};
use troupe_engine::{ExecutionBus, ExecutionManager};
use troupe_tools::ToolRegistry;

/// Shared state for all gateway handlers.
pub struct AppState {
    pub config: Config,
    pub manager: Arc<ExecutionManager>,
    pub bus: Arc<ExecutionBus>,
    pub teams: Arc<dyn TeamRepo>,
    pub executions: Arc<dyn ExecutionRepo>,
    pub logs: Arc<dyn ExecutionLogRepo>,
    pub models: Arc<dyn ModelRegistry>,
    pub tools: Arc<ToolRegistry>,
}
