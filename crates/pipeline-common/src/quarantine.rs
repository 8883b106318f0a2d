//! Holding area for objects a stage permanently rejected.
//!
//! Entries are moved in and never deleted by the engine; an operator inspects
//! and removes them by hand.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

use crate::queue::QueueManager;
use crate::{PipelineError, Result};

#[derive(Debug)]
pub struct Quarantine {
    root: PathBuf,
    count: AtomicUsize,
}

impl Quarantine {
    /// Open (creating if needed) the quarantine directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| PipelineError::io_path("creating quarantine", &root, e))?;
        let quarantine = Self {
            root,
            count: AtomicUsize::new(0),
        };
        let count = quarantine.list().await?.len();
        quarantine.count.store(count, Ordering::Relaxed);
        Ok(quarantine)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of quarantined objects.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn target_for(&self, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| QueueManager::embedded_filename(n).unwrap_or(n))
            .unwrap_or("object");
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        let unique = uuid::Uuid::new_v4().simple().to_string();
        self.root
            .join(format!("{}-{}_{}", stamp, &unique[..8], name))
    }

    /// Move `path` into the quarantine, returning its new location.
    ///
    /// The entry keeps its original name (queue prefixes are dropped) behind a
    /// timestamp so repeated rejections of the same name never collide. A
    /// rename across file systems falls back to copy and delete.
    pub async fn insert(&self, path: &Path) -> Result<PathBuf> {
        let target = self.target_for(path);

        if tokio::fs::rename(path, &target).await.is_err() {
            tokio::fs::copy(path, &target)
                .await
                .map_err(|e| PipelineError::io_path("copying into quarantine", path, e))?;
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "Quarantined copy made but original could not be removed");
            }
        }

        self.count.fetch_add(1, Ordering::Relaxed);
        debug!(from = %path.display(), to = %target.display(), "Quarantined object");
        Ok(target)
    }

    /// Quarantine a copy of `path`, leaving the original to its owner.
    pub async fn insert_copy(&self, path: &Path) -> Result<PathBuf> {
        let target = self.target_for(path);
        tokio::fs::copy(path, &target)
            .await
            .map_err(|e| PipelineError::io_path("copying into quarantine", path, e))?;
        self.count.fetch_add(1, Ordering::Relaxed);
        debug!(from = %path.display(), to = %target.display(), "Quarantined copy of object");
        Ok(target)
    }

    /// Paths of every quarantined object, oldest first.
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| PipelineError::io_path("scanning quarantine", &self.root, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await.is_ok_and(|t| t.is_file()) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}
