use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::routes;
use crate::sse;
use crate::state::AppState;

/// HTTP + SSE gateway server built on axum.
pub struct GatewayServer {
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(routes::health))
            .route("/teams", post(routes::create_team).get(routes::list_teams))
            .route(
                "/teams/{id}",
                get(routes::get_team)
                    .patch(routes::patch_team)
                    .delete(routes::delete_team),
            )
            .route("/teams/{id}/validate", post(routes::validate_team))
            .route(
                "/teams/{id}/executions",
                post(routes::trigger_execution).get(routes::list_team_executions),
            )
            .route("/executions/{id}", get(routes::get_execution))
            .route("/executions/{id}/stream", get(sse::stream_execution))
            .route("/executions/{id}/cancel", post(routes::cancel_execution))
            .route("/executions/{id}/logs", get(routes::get_logs))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Run the gateway until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        info!(bind = %self.state.config.bind_addr, "gateway listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("gateway shut down");
        Ok(())
    }
}
