use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::config::Settings;
use crate::error::AppError;
use crate::still::{CaptureReport, FailureReason};
use crate::utils;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamStats {
    pub sequence: u64,
    pub viewers: usize,
    pub has_frame: bool,
    pub capture_busy: bool,
}

pub fn create_api_router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/capture", post(capture))
        .route("/api/capture/last", get(last_capture))
        .route("/api/config", get(get_config).post(set_config))
        .route("/api/stream/stats", get(stream_stats))
}

/// 200 on success, 500 when the still could not be stored, 502 when the
/// camera or the remote host let us down
pub fn report_status(report: &CaptureReport) -> StatusCode {
    match report.reason {
        None => StatusCode::OK,
        Some(FailureReason::SaveError) => StatusCode::INTERNAL_SERVER_ERROR,
        Some(FailureReason::CaptureError) | Some(FailureReason::TransferError) => {
            StatusCode::BAD_GATEWAY
        }
    }
}

/// Synchronous: answers once the job is `done` or `failed`
async fn capture(State(state): State<AppState>) -> Result<Response, AppError> {
    let permit = state.pipeline.try_start().map_err(|e| {
        warn!("rejecting capture request: {}", e);
        AppError::busy(e)
    })?;
    let config = state.config.read().unwrap_or_else(|e| e.into_inner()).clone();

    // Detached so a client hanging up does not abandon the job half way
    let pipeline = state.pipeline.clone();
    let report = tokio::spawn(async move { pipeline.run(permit, config).await }).await?;

    Ok((report_status(&report), Json(report)).into_response())
}

async fn last_capture(State(state): State<AppState>) -> Result<Json<CaptureReport>, AppError> {
    state
        .pipeline
        .last_report()
        .map(Json)
        .ok_or_else(|| AppError::not_found("no still captured yet"))
}

async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.read().unwrap_or_else(|e| e.into_inner());
    debug!("Retrieved configuration");
    Json(config.settings().redacted())
}

async fn set_config(
    State(state): State<AppState>,
    Json(payload): Json<Settings>,
) -> Result<Json<Settings>, AppError> {
    let _writer = state.config_writer.lock().await;

    let mut updated = state.config.read().unwrap_or_else(|e| e.into_inner()).clone();
    updated.apply_settings(payload);
    if let Err(e) = updated.validate() {
        warn!("Invalid configuration: {}", e);
        return Err(AppError::bad_request(e));
    }

    let path = state.save_path.clone();
    let to_save = updated.clone();
    tokio::task::spawn_blocking(move || utils::save_config_to(&path, &to_save)).await??;
    let settings = updated.settings().redacted();
    *state.config.write().unwrap_or_else(|e| e.into_inner()) = updated;

    info!("Configuration updated successfully");
    Ok(Json(settings))
}

async fn stream_stats(State(state): State<AppState>) -> Json<StreamStats> {
    let snapshot = state.broadcaster.current_snapshot();
    Json(StreamStats {
        sequence: snapshot.as_ref().map(|(_, s)| *s).unwrap_or(0),
        viewers: state.viewers.load(Ordering::SeqCst),
        has_frame: snapshot.is_some(),
        capture_busy: state.pipeline.is_busy(),
    })
}
