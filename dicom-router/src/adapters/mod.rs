//! Database adapters for the pooled database export.
//!
//! An adapter connects one export worker to an external database: it records
//! exported objects and answers the verifier's uid queries. Adapters are
//! created by class name through an [`AdapterRegistry`]; each worker owns its
//! own instance, so adapters need not be `Sync`.

pub mod memory;
pub mod sqlite;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_common::{FileObject, Status};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::config::StageConfig;
use crate::storage::StoredObject;
use crate::utils::fs::io_error;
use crate::{Error, Result};

pub use memory::{MemoryAdapter, MemoryStore, MemoryStores};
pub use sqlite::SqliteAdapter;

/// What a database holds about one recorded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UidRecord {
    pub date: DateTime<Utc>,
    pub digest: String,
}

/// Connection from one export worker to a database.
#[async_trait]
pub trait DatabaseAdapter: Send {
    async fn connect(&mut self) -> Status;

    async fn disconnect(&mut self);

    /// Record `object`. `stored` is the copy kept by the referenced file
    /// storage stage, when there is one.
    async fn process(&mut self, object: &FileObject, stored: Option<&StoredObject>) -> Result<Status>;

    /// Look up which of `uids` are recorded. Unknown uids are left out.
    async fn uid_query(&mut self, uids: &BTreeSet<String>) -> Result<BTreeMap<String, UidRecord>>;

    /// Release anything held beyond a connection. Called once when the worker exits.
    async fn shutdown(&mut self) {}
}

/// Builds an adapter from the export stage's configuration.
pub type AdapterConstructor =
    Arc<dyn Fn(&StageConfig) -> Result<Box<dyn DatabaseAdapter>> + Send + Sync>;

/// Maps adapter class names to constructors.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    constructors: HashMap<String, AdapterConstructor>,
    memory: MemoryStores,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `sqlite` and `memory` adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(sqlite::CLASS, |config| {
            Ok(Box::new(SqliteAdapter::from_config(config)?) as Box<dyn DatabaseAdapter>)
        });
        let stores = registry.memory.clone();
        registry.register(memory::CLASS, move |config| {
            let name = config.attr("database").unwrap_or("default");
            Ok(Box::new(MemoryAdapter::new(stores.store(name))) as Box<dyn DatabaseAdapter>)
        });
        registry
    }

    /// Register a constructor that reads its parameters from the stage configuration.
    pub fn register<F>(&mut self, class: &str, constructor: F)
    where
        F: Fn(&StageConfig) -> Result<Box<dyn DatabaseAdapter>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(class.to_ascii_lowercase(), Arc::new(constructor));
    }

    /// Register a constructor that takes no parameters.
    pub fn register_plain<F>(&mut self, class: &str, constructor: F)
    where
        F: Fn() -> Box<dyn DatabaseAdapter> + Send + Sync + 'static,
    {
        self.register(class, move |_| Ok(constructor()));
    }

    /// The named store shared by every `memory` adapter of this registry.
    pub fn memory_store(&self, name: &str) -> Arc<MemoryStore> {
        self.memory.store(name)
    }

    pub fn contains(&self, class: &str) -> bool {
        self.constructors.contains_key(&class.to_ascii_lowercase())
    }

    /// Build an adapter of `class` for the stage configured by `config`.
    pub fn create(&self, class: &str, config: &StageConfig) -> Result<Box<dyn DatabaseAdapter>> {
        let constructor = self
            .constructors
            .get(&class.to_ascii_lowercase())
            .ok_or_else(|| Error::not_found("Database adapter", class))?;
        constructor(config)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut classes: Vec<_> = self.constructors.keys().collect();
        classes.sort();
        f.debug_struct("AdapterRegistry").field("classes", &classes).finish()
    }
}

/// Hex-encoded SHA-256 of the file at `path`.
pub async fn file_digest(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_error("opening", path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| io_error("reading", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageRole;
    use tempfile::TempDir;

    struct NullAdapter;

    #[async_trait]
    impl DatabaseAdapter for NullAdapter {
        async fn connect(&mut self) -> Status {
            Status::Ok
        }
        async fn disconnect(&mut self) {}
        async fn process(&mut self, _object: &FileObject, _stored: Option<&StoredObject>) -> Result<Status> {
            Ok(Status::Ok)
        }
        async fn uid_query(&mut self, _uids: &BTreeSet<String>) -> Result<BTreeMap<String, UidRecord>> {
            Ok(BTreeMap::new())
        }
    }

    #[tokio::test]
    async fn test_file_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc");
        tokio::fs::write(&path, b"abc").await.unwrap();
        assert_eq!(
            file_digest(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let mut registry = AdapterRegistry::with_defaults();
        registry.register_plain("Null", || Box::new(NullAdapter));
        let config = StageConfig::new(StageRole::Export, "db");

        assert!(registry.contains("sqlite"));
        assert!(registry.contains("MEMORY"));
        assert!(registry.create("null", &config).is_ok());
        assert!(matches!(
            registry.create("oracle", &config),
            Err(Error::NotFound { .. })
        ));
    }
}
