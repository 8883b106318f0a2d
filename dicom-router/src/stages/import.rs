//! Queue-side half shared by the import stages.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use pipeline_common::{
    Acceptance, FileObject, ObjectInspector, Quarantine, QueueManager, StageStats, dispose,
    open_entry,
};
use tracing::debug;

use super::StageEnv;
use crate::Result;
use crate::config::StageConfig;

/// The import queue of a stage plus what it needs to hand objects out.
pub(crate) struct ImportQueue {
    pub(crate) queue: Arc<QueueManager>,
    pub(crate) quarantine: Option<Arc<Quarantine>>,
    pub(crate) acceptance: Acceptance,
    pub(crate) inspector: Arc<dyn ObjectInspector>,
    pub(crate) stats: Arc<StageStats>,
    checked_out: Mutex<HashMap<PathBuf, Instant>>,
}

impl ImportQueue {
    pub(crate) fn new(queue: Arc<QueueManager>, inspector: Arc<dyn ObjectInspector>) -> Self {
        Self {
            queue,
            quarantine: None,
            acceptance: Acceptance::default(),
            inspector,
            stats: StageStats::new(),
            checked_out: Mutex::new(HashMap::new()),
        }
    }

    /// Queue in `{root}/queue`, quarantine where configured.
    pub(crate) async fn open(config: &StageConfig, env: &StageEnv) -> Result<Self> {
        let root = config.root()?;
        let queue = Arc::new(QueueManager::open(root.join("queue")).await?);
        let mut import = Self::new(queue, env.inspector.clone());
        import.acceptance = config.acceptance();
        if let Some(dir) = config.quarantine() {
            import.quarantine = Some(Arc::new(Quarantine::open(dir).await?));
        }
        Ok(import)
    }

    /// Check out the next acceptable object.
    ///
    /// Unreadable and unacceptable entries are quarantined (or deleted) on the
    /// way without ending the call. If the quarantine cannot take one, the
    /// entry stays queued and the call ends empty.
    pub(crate) async fn next_object(&self, stage: &str) -> Option<FileObject> {
        while let Some(path) = self.queue.next_file().await {
            let accepted = match open_entry(&path, self.inspector.as_ref()).await {
                Some(object) if self.acceptance.accepts(object.kind()) => Some(object),
                Some(object) => {
                    debug!(stage = %stage, object = %object.file_name(), kind = %object.kind(), "Object type not accepted");
                    None
                }
                None => None,
            };
            match accepted {
                Some(object) => {
                    self.stats.record_in(object.file_name());
                    self.checked_out.lock().insert(path, Instant::now());
                    return Some(object);
                }
                None => {
                    self.stats.record_failure();
                    if !dispose(&path, &self.queue, self.quarantine.as_deref()).await {
                        return None;
                    }
                }
            }
        }
        None
    }

    /// Delete a checked-out entry. Paths outside the queue are ignored.
    pub(crate) async fn release(&self, stage: &str, path: &Path) {
        let started = self.checked_out.lock().remove(path);
        match self.queue.release(path).await {
            Ok(true) => {
                if let Some(started) = started {
                    self.stats.record_out(started.elapsed());
                }
            }
            Ok(false) => {}
            Err(e) => debug!(stage = %stage, path = %path.display(), error = %e, "Unable to release import object"),
        }
    }

    /// Put a checked-out entry back at its place in the queue.
    pub(crate) fn return_object(&self, stage: &str, path: &Path) {
        self.checked_out.lock().remove(path);
        if self.queue.return_to_pending(path) {
            debug!(stage = %stage, path = %path.display(), "Import object returned to the queue");
        }
    }
}
