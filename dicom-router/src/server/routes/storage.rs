//! Storage browsing: `/storage/{fs}/{study}/{file}`.
//!
//! Listings are JSON; a file is streamed back with a content type derived
//! from its extension. When authentication is required a caller needs the
//! `read` role, or a username equal to the file system name.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tokio_util::io::ReaderStream;

use crate::server::auth::BasicAuth;
use crate::server::error::{ApiError, ApiResult};
use crate::storage::FileSystemManager;

/// Role allowed to browse every file system.
pub const READ_ROLE: &str = "read";

#[derive(Clone)]
pub struct StorageState {
    pub manager: Arc<FileSystemManager>,
    pub auth: Arc<BasicAuth>,
    pub require_authentication: bool,
}

#[derive(Debug, Serialize)]
pub struct Listing {
    pub path: String,
    pub entries: Vec<String>,
}

pub fn router(state: StorageState) -> Router {
    Router::new()
        .route("/storage", get(list_file_systems))
        .route("/storage/{fs}", get(list_studies))
        .route("/storage/{fs}/{study}", get(list_files))
        .route("/storage/{fs}/{study}/{file}", get(get_file))
        .with_state(state)
}

fn authorize(state: &StorageState, headers: &HeaderMap, file_system: Option<&str>) -> ApiResult<()> {
    if !state.require_authentication {
        return Ok(());
    }
    let user = state
        .auth
        .authenticate(headers)
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
    let owner = file_system.is_some_and(|fs| fs == user.username);
    if user.has_role(READ_ROLE) || owner {
        Ok(())
    } else {
        Err(ApiError::forbidden("Not allowed to read this storage"))
    }
}

async fn list_file_systems(
    State(state): State<StorageState>,
    headers: HeaderMap,
) -> ApiResult<Json<Listing>> {
    authorize(&state, &headers, None)?;
    Ok(Json(Listing {
        path: "/storage".to_string(),
        entries: state
            .manager
            .file_systems()
            .iter()
            .map(|fs| fs.name().to_string())
            .collect(),
    }))
}

async fn list_studies(
    State(state): State<StorageState>,
    Path(fs): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Listing>> {
    authorize(&state, &headers, Some(&fs))?;
    let file_system = state
        .manager
        .file_system(&fs)
        .ok_or_else(|| ApiError::not_found(format!("File system '{fs}' not found")))?;
    Ok(Json(Listing {
        path: format!("/storage/{fs}"),
        entries: file_system
            .studies()
            .iter()
            .map(|study| study.key().to_string())
            .collect(),
    }))
}

async fn list_files(
    State(state): State<StorageState>,
    Path((fs, study)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Listing>> {
    authorize(&state, &headers, Some(&fs))?;
    let study = state
        .manager
        .file_system(&fs)
        .and_then(|file_system| file_system.study(&study))
        .ok_or_else(|| ApiError::not_found(format!("Study '{study}' not found in '{fs}'")))?;
    Ok(Json(Listing {
        path: format!("/storage/{fs}/{}", study.key()),
        entries: study.files(),
    }))
}

async fn get_file(
    State(state): State<StorageState>,
    Path((fs, study, file)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    authorize(&state, &headers, Some(&fs))?;
    let path = state
        .manager
        .file_system(&fs)
        .and_then(|file_system| file_system.study(&study))
        .and_then(|study| study.file(&file))
        .ok_or_else(|| ApiError::not_found(format!("'{file}' not found")))?;

    let handle = match tokio::fs::File::open(&path).await {
        Ok(handle) => handle,
        // purged between the lookup and the open
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found(format!("'{file}' not found")));
        }
        Err(e) => return Err(crate::Error::io_path("opening stored file", &path, e).into()),
    };

    let mut response = Body::from_stream(ReaderStream::new(handle)).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type(&file)));
    Ok(response)
}

fn content_type(file: &str) -> &'static str {
    let extension = std::path::Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("dcm") => "application/dicom",
        Some("xml") => "text/xml; charset=utf-8",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
