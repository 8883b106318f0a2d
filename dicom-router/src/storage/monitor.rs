//! Retention for a file storage: studies untouched for longer than the time
//! depth are deleted.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use pipeline_common::sleep_or_cancel;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::FileSystemManager;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Time between retention passes.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct StorageMonitor {
    manager: Arc<FileSystemManager>,
    time_depth: Duration,
    interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StorageMonitor {
    /// Monitor keeping `time_depth_days` days of studies.
    pub fn new(manager: Arc<FileSystemManager>, time_depth_days: u32) -> Self {
        Self {
            manager,
            time_depth: DAY * time_depth_days,
            interval: DEFAULT_MONITOR_INTERVAL,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn time_depth(&self) -> Duration {
        self.time_depth
    }

    /// One retention pass: reindex from disk, then purge expired studies.
    ///
    /// A failed reindex still purges what is already indexed.
    pub async fn run_once(&self) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(self.time_depth)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if let Err(e) = self.manager.rescan().await {
            warn!(root = %self.manager.root().display(), error = %e, "Storage reindex failed");
        }
        let removed = self.manager.purge_older_than(cutoff).await;
        if removed > 0 {
            info!(
                "Storage monitor removed {} studies from {}",
                removed,
                self.manager.root().display()
            );
        }
        removed
    }

    /// Start the background task. A zero time depth disables the monitor.
    pub fn start(self: &Arc<Self>) {
        if self.time_depth.is_zero() {
            return;
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let monitor = self.clone();
        *task = Some(tokio::spawn(async move {
            debug!(root = %monitor.manager.root().display(), "Storage monitor started");
            loop {
                monitor.run_once().await;
                if !sleep_or_cancel(&monitor.cancel, monitor.interval).await {
                    break;
                }
            }
            debug!(root = %monitor.manager.root().display(), "Storage monitor stopped");
        }));
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_down(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_common::{FileObject, ObjectKind, ObjectMetadata};
    use tempfile::TempDir;

    async fn store(manager: &FileSystemManager, src: &TempDir, uid: &str, study: &str) -> std::path::PathBuf {
        let path = src.path().join(uid);
        tokio::fs::write(&path, uid).await.unwrap();
        let object = FileObject::new(
            path,
            ObjectKind::Dicom,
            ObjectMetadata::default().with_uid(uid).with_study_uid(study),
        );
        manager.store("fs", &object).await.unwrap().file
    }

    fn age(path: &std::path::Path, days: u64) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - DAY * days as u32)
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_studies_are_removed() {
        let src = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(FileSystemManager::open(dir.path(), false).await.unwrap());

        let old = store(&manager, &src, "1.1", "old").await;
        let fresh = store(&manager, &src, "2.1", "fresh").await;
        age(&old, 40);

        let monitor = StorageMonitor::new(manager.clone(), 30);
        assert_eq!(monitor.run_once().await, 1);
        assert!(!old.exists());
        assert!(fresh.exists());

        let fs = manager.file_system("fs").unwrap();
        assert!(fs.study("old").is_none());
        assert!(fs.study("fresh").is_some());
    }

    #[tokio::test]
    async fn test_zero_time_depth_never_starts() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(FileSystemManager::open(dir.path(), false).await.unwrap());
        let monitor = Arc::new(StorageMonitor::new(manager, 0));
        monitor.start();
        assert!(monitor.is_down());
    }

    #[tokio::test]
    async fn test_background_task_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(FileSystemManager::open(dir.path(), false).await.unwrap());
        let monitor = Arc::new(
            StorageMonitor::new(manager, 1).with_interval(Duration::from_millis(20)),
        );
        monitor.start();
        assert!(!monitor.is_down());
        monitor.shutdown();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !monitor.is_down() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
