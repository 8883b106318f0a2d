//! Push import: files dropped into a watched directory are moved into the
//! stage's queue once they have stopped changing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_common::{
    Acceptance, FileObject, ImportService, PipelineStage, Quarantine, QueueManager, StageState,
    StageStatus, sleep_or_cancel,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StageEnv;
use super::import::ImportQueue;
use crate::config::StageConfig;
use crate::utils::fs::{ensure_dir_all_with_op, io_error};
use crate::Result;

/// Files younger than this may still be being written.
const DEFAULT_MIN_AGE: Duration = Duration::from_secs(5);

pub struct DirectoryImportService {
    id: String,
    name: String,
    import_dir: PathBuf,
    interval: Duration,
    min_age: Duration,
    import: Arc<ImportQueue>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DirectoryImportService {
    pub const CLASS: &'static str = "DirectoryImportService";

    /// Watches `import` (default `{root}/import`); `minAge` is in milliseconds.
    pub async fn from_config(config: &StageConfig, env: &StageEnv) -> Result<Self> {
        let import_dir = match config.attr("import") {
            Some(dir) => PathBuf::from(dir),
            None => config.root()?.join("import"),
        };
        let import = ImportQueue::open(config, env).await?;
        let mut stage = Self::new(config.id(), config.name(), import_dir, import)
            .with_interval(config.interval());
        if let Some(ms) = config.int("minAge") {
            stage = stage.with_min_age(Duration::from_millis(ms.max(0) as u64));
        }
        Ok(stage)
    }

    pub(crate) fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        import_dir: impl Into<PathBuf>,
        import: ImportQueue,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            import_dir: import_dir.into(),
            interval: Duration::from_millis(pipeline_common::ExportConfig::DEFAULT_INTERVAL_MS),
            min_age: DEFAULT_MIN_AGE,
            import: Arc::new(import),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    pub fn import_dir(&self) -> &Path {
        &self.import_dir
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.import.queue
    }
}

#[async_trait]
impl PipelineStage for DirectoryImportService {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn acceptance(&self) -> Acceptance {
        self.import.acceptance
    }

    fn quarantine(&self) -> Option<&Quarantine> {
        self.import.quarantine.as_deref()
    }

    async fn start(&self) -> pipeline_common::Result<()> {
        if !self.import.stats.try_start() {
            return Ok(());
        }
        if let Err(e) = ensure_dir_all_with_op("creating import directory", &self.import_dir).await {
            warn!("{}: {}", self.name, e);
        }
        let scanner = Scanner {
            stage: self.name.clone(),
            import_dir: self.import_dir.clone(),
            interval: self.interval,
            min_age: self.min_age,
            queue: self.import.queue.clone(),
            cancel: self.cancel.clone(),
        };
        *self.task.lock() = Some(tokio::spawn(scanner.run()));
        info!("Started {} watching {}", self.name, self.import_dir.display());
        Ok(())
    }

    async fn shutdown(&self) {
        if self.import.stats.state() == StageState::Running {
            self.import.stats.set_state(StageState::Stopping);
        }
        self.cancel.cancel();
        if self.task.lock().is_none() {
            self.import.stats.set_state(StageState::Stopped);
        }
    }

    fn is_down(&self) -> bool {
        let down = self
            .task
            .lock()
            .as_ref()
            .is_none_or(|handle| handle.is_finished());
        if down && self.import.stats.state() == StageState::Stopping {
            self.import.stats.set_state(StageState::Stopped);
        }
        down
    }

    fn status(&self) -> StageStatus {
        self.import
            .stats
            .snapshot(&self.id, &self.name, Self::CLASS)
            .with_queue_size(self.import.queue.size())
            .with_quarantine(self.import.quarantine.as_deref())
            .with_detail("import_dir", self.import_dir.display())
    }
}

#[async_trait]
impl ImportService for DirectoryImportService {
    async fn next_object(&self) -> Option<FileObject> {
        self.import.next_object(&self.name).await
    }

    async fn release(&self, path: &Path) {
        self.import.release(&self.name, path).await;
    }

    async fn return_object(&self, path: &Path) {
        self.import.return_object(&self.name, path);
    }
}

struct Scanner {
    stage: String,
    import_dir: PathBuf,
    interval: Duration,
    min_age: Duration,
    queue: Arc<QueueManager>,
    cancel: CancellationToken,
}

impl Scanner {
    async fn run(self) {
        loop {
            match self.scan_once().await {
                Ok(0) => {}
                Ok(moved) => debug!(stage = %self.stage, moved, "Imported files"),
                Err(e) => warn!(stage = %self.stage, error = %e, "Import scan failed"),
            }
            if !sleep_or_cancel(&self.cancel, self.interval).await {
                break;
            }
        }
    }

    /// Move every settled file under the import directory into the queue.
    async fn scan_once(&self) -> Result<usize> {
        let settled_before = SystemTime::now()
            .checked_sub(self.min_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut pending = vec![self.import_dir.clone()];
        let mut moved = 0;

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error("scanning", &dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error("scanning", &dir, e))?
            {
                if self.cancel.is_cancelled() {
                    return Ok(moved);
                }
                let path = entry.path();
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                if meta.modified().is_ok_and(|m| m > settled_before) {
                    continue;
                }
                self.queue.enqueue(&path).await?;
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(stage = %self.stage, path = %path.display(), error = %e, "Queued but unable to remove import file");
                }
                moved += 1;
            }
        }
        Ok(moved)
    }
}
