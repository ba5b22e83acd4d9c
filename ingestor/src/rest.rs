use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use alcowatch_ingestor::cleanup::{CleanupScheduler, CleanupStatus};
use alcowatch_ingestor::connection::ConnectionManager;
use alcowatch_ingestor::errors::Error;
use alcowatch_ingestor::metrics;
use alcowatch_ingestor::model::{CleanupSchedule, TelemetryReading};

use crate::hub::{self, Hub};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
    pub scheduler: Arc<CleanupScheduler>,
    pub hub: Hub,
}

#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRunResponse {
    deleted_count: u64,
    status: CleanupStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    device_id: String,
    connected: bool,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/readings/latest", get(all_latest))
        .route("/api/v1/readings/latest/:device_id", get(latest_for_device))
        .route("/api/v1/devices/:device_id/connect", post(connect_device))
        .route("/api/v1/cleanup", get(cleanup_status))
        .route("/api/v1/cleanup/run", post(run_cleanup))
        .route("/api/v1/cleanup/enabled", post(set_cleanup_enabled))
        .route("/api/v1/cleanup/reset", post(reset_cleanup))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn all_latest(State(state): State<AppState>) -> Json<HashMap<String, TelemetryReading>> {
    Json(state.manager.get_all_latest_readings())
}

async fn latest_for_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<TelemetryReading>, AppError> {
    state
        .manager
        .get_latest_reading(&device_id)
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("no reading for device {}", device_id)).into())
}

async fn connect_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<ConnectResponse>, AppError> {
    let connected = state.manager.reconnect_device(&device_id).await?;
    Ok(Json(ConnectResponse {
        device_id,
        connected,
    }))
}

async fn cleanup_status(State(state): State<AppState>) -> Result<Json<CleanupStatus>, AppError> {
    Ok(Json(state.scheduler.get_config().await?))
}

async fn run_cleanup(State(state): State<AppState>) -> Result<Json<CleanupRunResponse>, AppError> {
    info!("Manual cleanup requested");
    let deleted_count = state.scheduler.run_cleanup().await?;
    let status = state.scheduler.get_config().await?;
    Ok(Json(CleanupRunResponse {
        deleted_count,
        status,
    }))
}

async fn set_cleanup_enabled(
    State(state): State<AppState>,
    Json(body): Json<EnabledRequest>,
) -> Result<Json<CleanupSchedule>, AppError> {
    Ok(Json(state.scheduler.set_enabled(body.enabled).await?))
}

async fn reset_cleanup(State(state): State<AppState>) -> Result<Json<CleanupSchedule>, AppError> {
    Ok(Json(state.scheduler.reset_schedule().await?))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let events = state.hub.subscribe();
    debug!(clients = state.hub.subscriber_count(), "WebSocket client subscribed");
    ws.on_upgrade(move |socket| hub::serve_socket(socket, events))
}

pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<Error>() {
            Some(Error::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(Error::Busy(_)) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("API error: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let not_found: AppError = Error::NotFound("D9".into()).into();
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let busy: AppError = Error::Busy("cleanup".into()).into();
        assert_eq!(busy.into_response().status(), StatusCode::CONFLICT);

        let other: AppError = anyhow::anyhow!("boom").into();
        assert_eq!(
            other.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
