//! One study directory inside a file system.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::debug;

use super::{TEMP_PREFIX, is_hidden, normalize_name};
use crate::Result;
use crate::utils::fs::{ensure_dir_all_with_op, io_error, newest_mtime};

/// Study key used for objects without a study identifier.
pub const UNKNOWN_STUDY: &str = "__unknown";

/// A directory of objects sharing a study identifier.
///
/// Stores hold the study lock shared; the storage monitor takes it exclusively
/// and skips the study when it is busy. Once purged a study is marked removed
/// and must be looked up again.
#[derive(Debug)]
pub struct Study {
    key: String,
    dir: PathBuf,
    files: Mutex<BTreeSet<String>>,
    lock: RwLock<()>,
    removed: AtomicBool,
}

impl Study {
    /// Directory-safe key for a study identifier.
    pub fn key_for(study_uid: Option<&str>) -> String {
        match study_uid.map(normalize_name) {
            Some(key) if !key.is_empty() => key,
            _ => UNKNOWN_STUDY.to_string(),
        }
    }

    pub(crate) fn new(key: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            dir: dir.into(),
            files: Mutex::new(BTreeSet::new()),
            lock: RwLock::new(()),
            removed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.lock().contains(name)
    }

    /// File names in the study, sorted.
    pub fn files(&self) -> Vec<String> {
        self.files.lock().iter().cloned().collect()
    }

    /// Path of `name` if the study holds it.
    pub fn file(&self, name: &str) -> Option<PathBuf> {
        self.contains(name).then(|| self.dir.join(name))
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Rebuild the file index from the study directory.
    pub(crate) async fn rescan(&self) -> Result<usize> {
        let mut found = BTreeSet::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.files.lock().clear();
                return Ok(0);
            }
            Err(e) => return Err(io_error("scanning study", &self.dir, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("scanning study", &self.dir, e))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_hidden(&name) {
                continue;
            }
            if entry.file_type().await.is_ok_and(|t| t.is_file()) {
                found.insert(name);
            }
        }
        let count = found.len();
        *self.files.lock() = found;
        Ok(count)
    }

    /// Copy `source` into the study as `name`.
    ///
    /// When `accept_duplicates` is false an existing file of that name is kept
    /// and returned untouched. Returns `None` if the study was purged while
    /// waiting for the lock.
    pub(crate) async fn store(
        &self,
        source: &Path,
        name: &str,
        accept_duplicates: bool,
    ) -> Result<Option<PathBuf>> {
        let _guard = self.lock.read().await;
        if self.is_removed() {
            return Ok(None);
        }

        let target = self.dir.join(name);
        if !accept_duplicates && self.contains(name) {
            debug!(study = %self.key, file = %name, "Already stored");
            return Ok(Some(target));
        }

        ensure_dir_all_with_op("creating study directory", &self.dir).await?;
        let temp = self
            .dir
            .join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::copy(source, &temp).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error("storing", source, e));
        }
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error("storing", &target, e));
        }

        self.files.lock().insert(name.to_string());
        Ok(Some(target))
    }

    /// Delete the study if nothing in it changed since `cutoff`.
    ///
    /// A study that is being written to is left alone. Returns true when the
    /// study was removed.
    pub(crate) async fn purge_if_older(&self, cutoff: SystemTime) -> Result<bool> {
        let Ok(_guard) = self.lock.try_write() else {
            debug!(study = %self.key, "Study busy; skipping");
            return Ok(false);
        };

        if tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            if newest_mtime(&self.dir).await? >= cutoff {
                return Ok(false);
            }
            tokio::fs::remove_dir_all(&self.dir)
                .await
                .map_err(|e| io_error("removing study", &self.dir, e))?;
        }

        self.removed.store(true, Ordering::Release);
        self.files.lock().clear();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_key_for() {
        assert_eq!(Study::key_for(Some("1.2.3")), "1.2.3");
        assert_eq!(Study::key_for(Some("a/b")), "a_b");
        assert_eq!(Study::key_for(Some("..")), "__");
        assert_eq!(Study::key_for(Some("  ")), UNKNOWN_STUDY);
        assert_eq!(Study::key_for(None), UNKNOWN_STUDY);
    }

    #[tokio::test]
    async fn test_store_is_idempotent_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let study = Study::new("s1", dir.path().join("s1"));
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        tokio::fs::write(&first, b"one").await.unwrap();
        tokio::fs::write(&second, b"two").await.unwrap();

        let a = study.store(&first, "x.dcm", false).await.unwrap().unwrap();
        let b = study.store(&second, "x.dcm", false).await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(tokio::fs::read(&a).await.unwrap(), b"one");
        assert_eq!(study.len(), 1);

        study.store(&second, "x.dcm", true).await.unwrap();
        assert_eq!(tokio::fs::read(&a).await.unwrap(), b"two");
        assert_eq!(study.files(), vec!["x.dcm".to_string()]);
    }

    #[tokio::test]
    async fn test_rescan_ignores_hidden_files() {
        let dir = TempDir::new().unwrap();
        let study_dir = dir.path().join("s1");
        tokio::fs::create_dir_all(&study_dir).await.unwrap();
        tokio::fs::write(study_dir.join("a.dcm"), b"a").await.unwrap();
        tokio::fs::write(study_dir.join(".tmp-123"), b"partial").await.unwrap();

        let study = Study::new("s1", &study_dir);
        assert_eq!(study.rescan().await.unwrap(), 1);
        assert!(study.contains("a.dcm"));
        assert!(study.file("missing.dcm").is_none());
    }

    #[tokio::test]
    async fn test_purge_respects_cutoff_and_busy_lock() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        tokio::fs::write(&source, b"x").await.unwrap();
        let study = Study::new("s1", dir.path().join("s1"));
        study.store(&source, "x.dcm", false).await.unwrap();

        let past = SystemTime::now() - Duration::from_secs(3600);
        assert!(!study.purge_if_older(past).await.unwrap());

        let future = SystemTime::now() + Duration::from_secs(3600);
        {
            let _busy = study.lock.read().await;
            assert!(!study.purge_if_older(future).await.unwrap());
        }
        assert!(study.purge_if_older(future).await.unwrap());
        assert!(study.is_removed());
        assert!(!study.dir().exists());
        assert!(study.store(&source, "x.dcm", false).await.unwrap().is_none());
    }
}
