//! Operational snapshot of every pipeline and stage.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::HeaderMap,
    routing::get,
};
use pipeline_common::StageStatus;
use serde::Serialize;

use super::AdminState;
use crate::context::PipelineStatus;
use crate::server::error::{ApiError, ApiResult};

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub host: String,
    pub uptime_secs: u64,
    pub pipelines: Vec<PipelineStatus>,
}

pub fn router() -> Router<AdminState> {
    Router::new()
        .route("/", get(get_status))
        .route("/stages/{id}", get(get_stage))
}

async fn get_status(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> ApiResult<Json<StatusResponse>> {
    state.authorize(&headers, None)?;
    let context = &state.context;
    Ok(Json(StatusResponse {
        host: context.host().to_string(),
        uptime_secs: context.uptime().as_secs(),
        pipelines: context.status(),
    }))
}

async fn get_stage(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<StageStatus>> {
    state.authorize(&headers, None)?;
    state
        .context
        .stage(&id)
        .map(|stage| Json(stage.status()))
        .ok_or_else(|| ApiError::not_found(format!("Stage '{id}' not found")))
}
