use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use troupe_core::config::Config;
use troupe_engine::{ExecutionBus, ExecutionManager, RetentionSweeper};
use troupe_gateway::{AppState, GatewayServer};
use troupe_llm::{HttpChatClient, StaticModelRegistry};
use troupe_store::SqliteStore;
use troupe_tools::ToolRegistry;

const EXIT_OK: u8 = 0;
const EXIT_STARTUP: u8 = 1;
const EXIT_MIGRATION: u8 = 2;

#[derive(Parser)]
#[command(name = "troupe", version, about = "Hierarchical LLM agent team orchestration service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestration service (default)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Config => {
            match serde_json::to_string_pretty(&config) {
                Ok(rendered) => println!("{rendered}"),
                Err(e) => {
                    error!(error = %e, "failed to render config");
                    return ExitCode::from(EXIT_STARTUP);
                }
            }
            ExitCode::from(EXIT_OK)
        }
        Commands::Migrate => match open_store(&config) {
            Ok(_) => {
                info!("migrations applied");
                ExitCode::from(EXIT_OK)
            }
            Err(code) => ExitCode::from(code),
        },
        Commands::Serve => serve(config).await,
    }
}

fn open_store(config: &Config) -> Result<Arc<SqliteStore>, u8> {
    let store = match SqliteStore::connect(&PathBuf::from(&config.database_url)) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, url = %config.database_url, "store unreachable");
            return Err(EXIT_STARTUP);
        }
    };
    if let Err(e) = store.migrate() {
        error!(error = %e, "migration failed");
        return Err(EXIT_MIGRATION);
    }
    Ok(Arc::new(store))
}

async fn serve(config: Config) -> ExitCode {
    let store = match open_store(&config) {
        Ok(store) => store,
        Err(code) => return ExitCode::from(code),
    };

    // Reconcile zombies before the API opens so stale RUNNING rows
    // never pollute the concurrency count.
    if let Err(e) = ExecutionManager::recover(store.as_ref()).await {
        error!(error = %e, "startup recovery failed");
        return ExitCode::from(EXIT_STARTUP);
    }

    let models = Arc::new(StaticModelRegistry::new());
    register_models_from_env(&models);
    let tools = Arc::new(ToolRegistry::with_builtins());
    let bus = Arc::new(ExecutionBus::new(store.clone()));

    let manager = ExecutionManager::new(
        store.clone(),
        store.clone(),
        bus.clone(),
        models.clone(),
        tools.clone(),
        config.max_concurrent_executions,
    );

    let shutdown = tokio_util::sync::CancellationToken::new();

    let sweeper = match RetentionSweeper::new(
        store.clone(),
        &config.retention_cron,
        config.retention_days,
        shutdown.clone(),
    ) {
        Ok(sweeper) => sweeper,
        Err(e) => {
            error!(error = %e, "invalid retention schedule");
            return ExitCode::from(EXIT_STARTUP);
        }
    };
    let sweeper_task = tokio::spawn(async move { sweeper.run().await });

    let state = Arc::new(AppState {
        config: config.clone(),
        manager,
        bus,
        teams: store.clone(),
        executions: store.clone(),
        logs: store.clone(),
        models,
        tools,
    });
    let server = GatewayServer::new(state);

    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        })
    };

    let result = server.run(shutdown.clone()).await;
    shutdown.cancel();
    ctrl_c.abort();
    let _ = sweeper_task.await;

    match result {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            error!(error = %e, "gateway failed");
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

/// The provider/credential registry proper lives outside this service;
/// a single OpenAI-compatible binding from the environment covers the
/// common single-provider deployment.
fn register_models_from_env(models: &StaticModelRegistry) {
    let (Ok(provider), Ok(model_id), Ok(base_url), Ok(api_key)) = (
        std::env::var("LLM_PROVIDER"),
        std::env::var("LLM_MODEL_ID"),
        std::env::var("LLM_BASE_URL"),
        std::env::var("LLM_API_KEY"),
    ) else {
        warn!("no LLM_* environment binding; model registry starts empty");
        return;
    };
    info!(provider = %provider, model_id = %model_id, "registered model from environment");
    models.register(
        &provider,
        &model_id,
        Arc::new(HttpChatClient::new(base_url, model_id.clone(), api_key)),
    );
}
