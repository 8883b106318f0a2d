//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! reduce duplicated `create_dir_all` calls.

use std::path::Path;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Last modification time of `path`.
///
/// For a non-empty directory this is the newest mtime among its direct
/// children; an empty directory falls back to its own mtime.
pub async fn newest_mtime(path: &Path) -> Result<std::time::SystemTime> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| io_error("reading metadata of", path, e))?;
    let own = meta
        .modified()
        .map_err(|e| io_error("reading mtime of", path, e))?;
    if !meta.is_dir() {
        return Ok(own);
    }

    let mut newest = None;
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| io_error("scanning", path, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("scanning", path, e))?
    {
        if let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) {
            newest = Some(newest.map_or(modified, |n: std::time::SystemTime| n.max(modified)));
        }
    }
    Ok(newest.unwrap_or(own))
}
