use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use quarrel_core::config::{GatewayConfig, MalformedPolicy};
use quarrel_core::settings::SettingsStore;
use quarrel_engine::SubmissionHandle;

use crate::routes;
use crate::state::AppState;

/// HTTP intake for the configuration surface, built on axum.
pub struct GatewayServer {
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        malformed_lines: MalformedPolicy,
        handle: SubmissionHandle,
        settings: SettingsStore,
    ) -> Self {
        Self {
            state: Arc::new(AppState {
                config,
                malformed_lines,
                handle,
                settings,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(routes::health))
            .route("/api/status", get(routes::status))
            .route("/api/settings", get(routes::settings))
            .route("/api/submit", post(routes::submit))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Serve until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let bind = &self.state.config.bind;
        let listener = TcpListener::bind(bind).await?;
        info!(bind = %bind, "Gateway listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
