//! REST API server for liverec.
//!
//! Provides HTTP endpoints for:
//! - Service info and version
//! - Recorder control (list, add, inspect, remove, restart)

pub mod error;
pub mod routes;

use crate::config::ApiConfig;
use crate::recorders::Manager;
use anyhow::{Context, Result};
use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use routes::recorders::{AddRecorderRequest, RecorderView, RecordersState};

pub struct ApiServer {
    bind: String,
    port: u16,
    recorders_state: RecordersState,
}

impl ApiServer {
    pub fn new(manager: Arc<Manager>, config: &ApiConfig) -> Self {
        Self {
            bind: config.bind.clone(),
            port: config.port,
            recorders_state: RecordersState { manager },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(status))
            .route("/version", get(version))
            .nest(
                "/recorders",
                routes::recorders::router(self.recorders_state.clone()),
            )
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let app = self.router();
        let addr = format!("{}:{}", self.bind, self.port);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind API server to {addr}"))?;

        info!("API server listening on http://{}", addr);
        info!("Endpoints:");
        info!("  GET    /                       - Service info");
        info!("  GET    /version                - Get version info");
        info!("  GET    /recorders              - List recorders");
        info!("  POST   /recorders              - Start recording a room");
        info!("  GET    /recorders/{{id}}         - Get recorder state");
        info!("  DELETE /recorders/{{id}}         - Stop recording a room");
        info!("  POST   /recorders/{{id}}/restart - Restart a room's recorder");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

async fn status() -> Json<Value> {
    Json(json!({
        "service": "liverec",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": "liverec"
    }))
}
