use axum::{
    routing::get,
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::TraceLayer,
};
use std::sync::Arc;
use tokio::net::TcpListener;

use consensus::ConsensusManager;

use crate::{ApiResult, ApiError};
use crate::handlers::*;

pub struct Server {
    config: crate::Config,
    app_state: Arc<AppState>,
}

impl Server {
    pub fn new(config: crate::Config, consensus_manager: Arc<ConsensusManager>) -> Self {
        Self {
            config,
            app_state: Arc::new(AppState { consensus_manager }),
        }
    }

    pub async fn start(&self) -> ApiResult<()> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(addr).await
            .map_err(|e| ApiError::InternalError(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> ApiResult<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Starting API server on {}", addr);
        }

        axum::serve(listener, self.router()).await
            .map_err(|e| ApiError::InternalError(format!("Server error: {}", e)))?;

        Ok(())
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/kv", get(get_kv).post(set_kv).put(set_kv).delete(delete_kv))
            .route("/node", get(get_nodes).post(add_nodes).put(add_nodes).delete(delete_nodes))
            .route("/service", get(get_service).post(set_service).put(set_service).delete(delete_service))
            .route("/balance", get(balance))
            .route("/health", get(health_check))
            .fallback(not_found)
            .with_state(self.app_state.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive())
            )
    }
}

async fn not_found(uri: axum::http::Uri) -> ApiError {
    ApiError::NotFound(uri.path().to_string())
}
