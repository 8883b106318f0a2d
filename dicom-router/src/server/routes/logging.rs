//! Logging API routes: view and change the active filter at runtime.

use axum::{Json, Router, extract::State, http::HeaderMap, routing::get};
use serde::{Deserialize, Serialize};

use super::AdminState;
use crate::logging::available_modules;
use crate::server::auth::ADMIN_ROLE;
use crate::server::error::{ApiError, ApiResult};

/// Request to update the log filter.
#[derive(Debug, Deserialize)]
pub struct UpdateLogFilterRequest {
    pub filter: String,
}

#[derive(Debug, Serialize)]
pub struct LoggingConfigResponse {
    pub filter: String,
    pub available_modules: Vec<ModuleInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub description: String,
}

pub fn router() -> Router<AdminState> {
    Router::new().route("/level", get(get_logging_config).put(update_logging_config))
}

fn response(filter: String) -> LoggingConfigResponse {
    LoggingConfigResponse {
        filter,
        available_modules: available_modules()
            .into_iter()
            .map(|(name, description)| ModuleInfo {
                name: name.to_string(),
                description: description.to_string(),
            })
            .collect(),
    }
}

async fn get_logging_config(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> ApiResult<Json<LoggingConfigResponse>> {
    state.authorize(&headers, None)?;
    let logging = state
        .context
        .logging()
        .ok_or_else(|| ApiError::service_unavailable("Logging is not configured"))?;
    Ok(Json(response(logging.get_filter())))
}

async fn update_logging_config(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(request): Json<UpdateLogFilterRequest>,
) -> ApiResult<Json<LoggingConfigResponse>> {
    state.authorize(&headers, Some(ADMIN_ROLE))?;
    let logging = state
        .context
        .logging()
        .ok_or_else(|| ApiError::service_unavailable("Logging is not configured"))?;
    logging.set_filter(&request.filter)?;
    Ok(Json(response(logging.get_filter())))
}
