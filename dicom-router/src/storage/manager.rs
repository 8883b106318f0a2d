//! Registry of the file systems under one storage root.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use pipeline_common::FileObject;
use tracing::{info, warn};

use super::file_system::FileSystem;
use super::study::Study;
use super::{StoredObject, is_hidden, normalize_name};
use crate::Result;
use crate::utils::fs::{ensure_dir_all_with_op, io_error};

/// File system used when an object names none.
pub const DEFAULT_FILE_SYSTEM: &str = "__default";

/// Where an object was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLocation {
    pub file_system: String,
    pub study: String,
    pub name: String,
    pub file: PathBuf,
}

impl StoredLocation {
    /// `{base}/{file system}/{study}/{file}`
    pub fn url(&self, base: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            base.trim_end_matches('/'),
            self.file_system,
            self.study,
            self.name
        )
    }

    pub fn into_stored_object(self, base: &str) -> StoredObject {
        let url = self.url(base);
        StoredObject {
            file: self.file,
            url,
        }
    }
}

/// Owns the file systems below `root`, creating them on first use.
#[derive(Debug)]
pub struct FileSystemManager {
    root: PathBuf,
    accept_duplicates: bool,
    file_systems: DashMap<String, Arc<FileSystem>>,
}

impl FileSystemManager {
    /// Open the store at `root` and index what is already there.
    pub async fn open(root: impl Into<PathBuf>, accept_duplicates: bool) -> Result<Self> {
        let root = root.into();
        ensure_dir_all_with_op("creating storage root", &root).await?;
        let manager = Self {
            root,
            accept_duplicates,
            file_systems: DashMap::new(),
        };
        manager.rescan().await?;
        info!(
            root = %manager.root.display(),
            file_systems = manager.file_systems.len(),
            "Storage opened"
        );
        Ok(manager)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn accept_duplicates(&self) -> bool {
        self.accept_duplicates
    }

    /// Directory-safe file system name; blank names map to the default.
    pub fn file_system_name(raw: Option<&str>) -> String {
        match raw.map(normalize_name) {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_FILE_SYSTEM.to_string(),
        }
    }

    /// Look up a file system without creating it.
    pub fn file_system(&self, name: &str) -> Option<Arc<FileSystem>> {
        self.file_systems.get(name).map(|fs| fs.value().clone())
    }

    /// All file systems, sorted by name.
    pub fn file_systems(&self) -> Vec<Arc<FileSystem>> {
        let mut all: Vec<_> = self.file_systems.iter().map(|fs| fs.value().clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Look up a file system, creating its directory on first use.
    pub async fn get_or_create_file_system(&self, name: &str) -> Result<Arc<FileSystem>> {
        let name = Self::file_system_name(Some(name));
        if let Some(fs) = self.file_system(&name) {
            return Ok(fs);
        }
        let dir = self.root.join(&name);
        ensure_dir_all_with_op("creating file system", &dir).await?;
        let fs = self
            .file_systems
            .entry(name.clone())
            .or_insert_with(|| Arc::new(FileSystem::new(name, dir)))
            .clone();
        Ok(fs)
    }

    /// Store `object` in the named file system.
    pub async fn store(&self, file_system: &str, object: &FileObject) -> Result<StoredLocation> {
        let fs = self.get_or_create_file_system(file_system).await?;
        let (study, file) = fs.store(object, self.accept_duplicates).await?;
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        Ok(StoredLocation {
            file_system: fs.name().to_string(),
            study: study.key().to_string(),
            name,
            file,
        })
    }

    /// Find a stored file by file system, study identifier and file name.
    pub fn locate(&self, file_system: &str, study_uid: Option<&str>, name: &str) -> Option<StoredLocation> {
        let fs = self.file_system(&Self::file_system_name(Some(file_system)))?;
        let study = fs.study(&Study::key_for(study_uid))?;
        let file = study.file(name)?;
        Some(StoredLocation {
            file_system: fs.name().to_string(),
            study: study.key().to_string(),
            name: name.to_string(),
            file,
        })
    }

    /// Rebuild every index from the directory tree.
    pub async fn rescan(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error("scanning storage root", &self.root, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("scanning storage root", &self.root, e))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_hidden(&name) || !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let fs = self
                .file_systems
                .entry(name.clone())
                .or_insert_with(|| Arc::new(FileSystem::new(&name, entry.path())))
                .clone();
            if let Err(e) = fs.rescan().await {
                warn!(file_system = %name, error = %e, "Unable to index file system");
            }
        }
        Ok(())
    }

    /// Delete studies not modified since `cutoff` across every file system.
    pub async fn purge_older_than(&self, cutoff: SystemTime) -> usize {
        let mut removed = 0;
        for fs in self.file_systems() {
            removed += fs.purge_older_than(cutoff).await;
        }
        removed
    }
}
