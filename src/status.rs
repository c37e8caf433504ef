use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::config::StatusConfig;
use crate::core::detector::{SharedDetector, WindowStats};
use crate::core::pipeline::PipelineStats;
use crate::shutdown::Shutdown;
use crate::stream::SupervisorState;

/// Read-only view handed to the status endpoint.
#[derive(Clone)]
pub struct StatusState {
    detector: SharedDetector,
    pipeline: Arc<PipelineStats>,
    stream: watch::Receiver<SupervisorState>,
}

impl StatusState {
    pub fn new(detector: SharedDetector, pipeline: Arc<PipelineStats>, stream: watch::Receiver<SupervisorState>) -> Self {
        Self {
            detector,
            pipeline,
            stream,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub window: WindowStats,
    pub transactions_seen: u64,
    pub notifications_sent: u64,
    pub stream_state: SupervisorState,
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    error: bool,
    data: T,
    time: i64,
}

pub fn router(path: &str, state: StatusState) -> Router {
    Router::new()
        .route(path, get(status))
        .fallback(not_found)
        .with_state(state)
}

async fn status(State(state): State<StatusState>) -> Json<Envelope<StatusReport>> {
    let counters = state.pipeline.counters();
    Json(Envelope {
        error: false,
        data: StatusReport {
            window: state.detector.stats(),
            transactions_seen: counters.transactions_seen,
            notifications_sent: counters.notifications_sent,
            stream_state: *state.stream.borrow(),
        },
        time: Utc::now().timestamp(),
    })
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": true, "errorMessage": "not found" })),
    )
}

/// Serve until shutdown is triggered.
/// Bind the status listener, or `None` when the exporter is disabled.
/// Called before any task is spawned.
pub async fn bind(config: &StatusConfig) -> std::io::Result<Option<TcpListener>> {
    if !config.enabled {
        return Ok(None);
    }
    TcpListener::bind(config.listen).await.map(Some)
}

pub async fn serve(listener: TcpListener, path: &str, state: StatusState, shutdown: Shutdown) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, path = %path, "Status server started");
    axum::serve(listener, router(path, state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    info!("Status server stopped");
    Ok(())
}
