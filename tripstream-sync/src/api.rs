//! HTTP surface for triggering syncs and inspecting progress.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tripstream_core::{DeviceId, SyncKind};

use crate::orchestrator::SyncOrchestrator;
use crate::storage::{CheckpointStore, PositionStore, RateLimitStore, TripStore};
use crate::upstream::UpstreamProvider;

pub struct AppState<P, S> {
    pub orchestrator: Arc<SyncOrchestrator<P, S>>,
    pub storage: S,
}

// Manual impl: `P` carries no `Clone` bound and never needs one here.
impl<P, S: Clone> Clone for AppState<P, S> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
            storage: self.storage.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    /// Devices to sync; empty means all known devices.
    #[serde(default)]
    pub device_ids: Vec<String>,
    /// Ignore checkpoints and re-cover the wide lookback window.
    #[serde(default)]
    pub force_full_sync: bool,
    /// Re-cover only the short recent window.
    #[serde(default)]
    pub force_recent: bool,
}

pub fn router<P, S>() -> Router<AppState<P, S>>
where
    P: UpstreamProvider,
    S: PositionStore + TripStore + CheckpointStore + RateLimitStore + Clone,
{
    Router::new()
        .route("/api/sync", post(trigger_sync))
        .route("/api/sync/{device_id}", get(sync_status))
        .route("/health", get(health))
}

fn error_response(status: StatusCode, message: String) -> Response {
    let body = ApiResponse::<()> {
        success: false,
        data: None,
        message: Some(message),
    };
    (status, Json(body)).into_response()
}

fn success_response<T: Serialize>(status: StatusCode, data: T) -> Response {
    let body = ApiResponse {
        success: true,
        data: Some(data),
        message: None,
    };
    (status, Json(body)).into_response()
}

async fn health() -> &'static str {
    "OK"
}

/// Run a sync over the requested devices and return the full report.
///
/// The run happens inline: callers are other backend jobs that want the
/// report, not browsers that need a quick 202.
async fn trigger_sync<P, S>(
    State(state): State<AppState<P, S>>,
    Json(payload): Json<SyncRequest>,
) -> Response
where
    P: UpstreamProvider,
    S: PositionStore + TripStore + CheckpointStore + RateLimitStore + Clone,
{
    let kind = if payload.force_full_sync {
        SyncKind::Full
    } else if payload.force_recent {
        SyncKind::Recent
    } else {
        SyncKind::Incremental
    };

    let device_ids: Vec<DeviceId> = payload
        .device_ids
        .into_iter()
        .map(DeviceId::new)
        .collect();

    let report = state.orchestrator.sync_devices(device_ids, kind).await;
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    let body = ApiResponse {
        success: report.success,
        data: Some(report),
        message: None,
    };
    (status, Json(body)).into_response()
}

async fn sync_status<P, S>(
    Path(device_id): Path<String>,
    State(state): State<AppState<P, S>>,
) -> Response
where
    P: UpstreamProvider,
    S: PositionStore + TripStore + CheckpointStore + RateLimitStore + Clone,
{
    let device_id = DeviceId::new(device_id);
    match state.storage.get_checkpoint(&device_id).await {
        Ok(Some(checkpoint)) => success_response(StatusCode::OK, checkpoint),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("no sync checkpoint for device {device_id}"),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to load checkpoint: {e}"),
        ),
    }
}
