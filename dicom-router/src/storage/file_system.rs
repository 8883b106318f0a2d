//! A named partition of the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use pipeline_common::FileObject;
use tracing::{info, warn};

use super::study::Study;
use super::{is_hidden, stored_file_name};
use crate::utils::fs::io_error;
use crate::{Error, Result};

/// Attempts at storing when the target study is purged underneath us.
const STORE_ATTEMPTS: usize = 3;

/// A directory of studies.
#[derive(Debug)]
pub struct FileSystem {
    name: String,
    root: PathBuf,
    studies: DashMap<String, Arc<Study>>,
}

impl FileSystem {
    pub(crate) fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            studies: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn study(&self, key: &str) -> Option<Arc<Study>> {
        self.studies.get(key).map(|s| s.value().clone())
    }

    /// All studies, sorted by key.
    pub fn studies(&self) -> Vec<Arc<Study>> {
        let mut studies: Vec<_> = self.studies.iter().map(|s| s.value().clone()).collect();
        studies.sort_by(|a, b| a.key().cmp(b.key()));
        studies
    }

    pub fn study_count(&self) -> usize {
        self.studies.len()
    }

    fn study_for(&self, key: &str) -> Arc<Study> {
        let study = self
            .studies
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Study::new(key, self.root.join(key))))
            .clone();
        if !study.is_removed() {
            return study;
        }
        let fresh = Arc::new(Study::new(key, self.root.join(key)));
        self.studies.insert(key.to_string(), fresh.clone());
        fresh
    }

    /// Store `object` in the study named by its study identifier.
    ///
    /// Returns the study and the path of the stored file.
    pub async fn store(&self, object: &FileObject, accept_duplicates: bool) -> Result<(Arc<Study>, PathBuf)> {
        let key = Study::key_for(object.study_uid());
        let name = stored_file_name(object);
        for _ in 0..STORE_ATTEMPTS {
            let study = self.study_for(&key);
            if let Some(path) = study.store(object.path(), &name, accept_duplicates).await? {
                return Ok((study, path));
            }
        }
        Err(Error::Other(format!(
            "study {} of {} was removed while storing {}",
            key, self.name, name
        )))
    }

    /// Rebuild the study index from disk.
    pub(crate) async fn rescan(&self) -> Result<()> {
        let mut on_disk = Vec::new();
        match tokio::fs::read_dir(&self.root).await {
            Ok(mut entries) => {
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| io_error("scanning file system", &self.root, e))?
                {
                    let Ok(key) = entry.file_name().into_string() else {
                        continue;
                    };
                    if !is_hidden(&key) && entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                        on_disk.push(key);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("scanning file system", &self.root, e)),
        }

        for key in &on_disk {
            let study = self.study_for(key);
            if let Err(e) = study.rescan().await {
                warn!(file_system = %self.name, study = %key, error = %e, "Unable to index study");
            }
        }
        self.studies
            .retain(|key, study| on_disk.contains(key) || !study.is_empty());
        Ok(())
    }

    /// Delete every study not modified since `cutoff`. Returns how many went.
    ///
    /// A study that cannot be removed is logged and skipped.
    pub(crate) async fn purge_older_than(&self, cutoff: SystemTime) -> usize {
        let mut removed = 0;
        for study in self.studies() {
            match study.purge_if_older(cutoff).await {
                Ok(true) => {
                    self.studies
                        .remove_if(study.key(), |_, current| Arc::ptr_eq(current, &study));
                    info!("Removed study {} from {}", study.key(), self.name);
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(file_system = %self.name, study = %study.key(), error = %e, "Unable to remove study");
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_common::{ObjectKind, ObjectMetadata};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn object(dir: &TempDir, name: &str, uid: &str, study: Option<&str>) -> FileObject {
        let path = dir.path().join(name);
        tokio::fs::write(&path, uid).await.unwrap();
        let mut metadata = ObjectMetadata::default().with_uid(uid);
        if let Some(study) = study {
            metadata = metadata.with_study_uid(study);
        }
        FileObject::new(path, ObjectKind::Dicom, metadata)
    }

    #[tokio::test]
    async fn test_store_groups_by_study() {
        let src = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let fs = FileSystem::new("fs", dir.path().join("fs"));

        let (study, path) = fs
            .store(&object(&src, "a", "1.1", Some("9.9")).await, false)
            .await
            .unwrap();
        assert_eq!(study.key(), "9.9");
        assert_eq!(path, dir.path().join("fs").join("9.9").join("1.1.dcm"));

        let (unknown, _) = fs.store(&object(&src, "b", "1.2", None).await, false).await.unwrap();
        assert_eq!(unknown.key(), super::super::UNKNOWN_STUDY);
        assert_eq!(fs.study_count(), 2);
    }

    #[tokio::test]
    async fn test_rescan_picks_up_existing_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("fs");
        tokio::fs::create_dir_all(root.join("s1")).await.unwrap();
        tokio::fs::write(root.join("s1").join("a.dcm"), b"a").await.unwrap();

        let fs = FileSystem::new("fs", &root);
        fs.rescan().await.unwrap();
        assert!(fs.study("s1").unwrap().contains("a.dcm"));

        tokio::fs::remove_dir_all(root.join("s1")).await.unwrap();
        fs.rescan().await.unwrap();
        assert!(fs.study("s1").is_none());
    }

    #[tokio::test]
    async fn test_purged_study_is_recreated_on_next_store() {
        let src = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let fs = FileSystem::new("fs", dir.path().join("fs"));
        let obj = object(&src, "a", "1.1", Some("9.9")).await;
        fs.store(&obj, false).await.unwrap();

        let future = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(fs.purge_older_than(future).await, 1);
        assert_eq!(fs.study_count(), 0);

        let (study, path) = fs.store(&obj, false).await.unwrap();
        assert!(!study.is_removed());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_dot_study_stays_inside_the_file_system() {
        let src = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("fs");
        let fs = FileSystem::new("fs", &root);

        let (study, path) = fs
            .store(&object(&src, "a", "1.1", Some("..")).await, false)
            .await
            .unwrap();
        assert_eq!(study.key(), "__");
        assert_eq!(path, root.join("__").join("1.1.dcm"));

        // purging the study must leave the file system directory alone
        let future = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(fs.purge_older_than(future).await, 1);
        assert!(root.exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_purge_continues_past_a_failing_study() {
        let src = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("fs");
        let fs = FileSystem::new("fs", &root);
        fs.store(&object(&src, "a", "1.1", Some("a")).await, false).await.unwrap();
        let (_, kept) = fs.store(&object(&src, "b", "1.2", Some("b")).await, false).await.unwrap();

        // a regular file where study `a` lives cannot be removed as a directory
        tokio::fs::remove_dir_all(root.join("a")).await.unwrap();
        tokio::fs::write(root.join("a"), b"x").await.unwrap();

        let future = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(fs.purge_older_than(future).await, 1);
        assert!(fs.study("a").is_some());
        assert!(fs.study("b").is_none());
        assert!(!kept.exists());
    }
}
