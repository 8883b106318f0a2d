//! In-process adapter, mostly useful for trials and tests.
//!
//! Adapters configured with the same `database` name share one store, so the
//! verifier sees what the workers recorded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use pipeline_common::{FileObject, Status};
use tracing::debug;

use super::{DatabaseAdapter, UidRecord, file_digest};
use crate::Result;
use crate::storage::StoredObject;

pub const CLASS: &str = "memory";

/// Records kept in memory.
#[derive(Debug)]
pub struct MemoryStore {
    records: DashMap<String, UidRecord>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, uid: &str) -> Option<UidRecord> {
        self.records.get(uid).map(|r| r.value().clone())
    }

    pub fn insert(&self, uid: impl Into<String>, record: UidRecord) {
        self.records.insert(uid.into(), record);
    }

    /// While unavailable, connecting reports `Retry`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// Named stores.
#[derive(Debug, Clone, Default)]
pub struct MemoryStores(Arc<DashMap<String, Arc<MemoryStore>>>);

impl MemoryStores {
    pub fn store(&self, name: &str) -> Arc<MemoryStore> {
        self.0.entry(name.to_string()).or_default().clone()
    }
}

pub struct MemoryAdapter {
    store: Arc<MemoryStore>,
    connected: bool,
}

impl MemoryAdapter {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            connected: false,
        }
    }
}

#[async_trait]
impl DatabaseAdapter for MemoryAdapter {
    async fn connect(&mut self) -> Status {
        self.connected = self.store.is_available();
        if self.connected { Status::Ok } else { Status::Retry }
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn process(&mut self, object: &FileObject, stored: Option<&StoredObject>) -> Result<Status> {
        if !self.connected {
            return Ok(Status::Retry);
        }
        let Some(uid) = object.uid() else {
            debug!(object = %object.file_name(), "No uid; cannot record");
            return Ok(Status::Fail);
        };
        let file = stored.map(|s| s.file.as_path()).unwrap_or(object.path());
        let digest = file_digest(file).await?;
        self.store.insert(
            uid,
            UidRecord {
                date: Utc::now(),
                digest,
            },
        );
        Ok(Status::Ok)
    }

    async fn uid_query(&mut self, uids: &BTreeSet<String>) -> Result<BTreeMap<String, UidRecord>> {
        Ok(uids
            .iter()
            .filter_map(|uid| self.store.get(uid).map(|r| (uid.clone(), r)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_common::{ObjectKind, ObjectMetadata};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_records_and_queries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a");
        tokio::fs::write(&path, b"abc").await.unwrap();
        let stores = MemoryStores::default();
        let mut adapter = MemoryAdapter::new(stores.store("db"));

        let object = FileObject::new(&path, ObjectKind::File, ObjectMetadata::default().with_uid("1.1"));
        assert_eq!(adapter.process(&object, None).await.unwrap(), Status::Retry);
        assert_eq!(adapter.connect().await, Status::Ok);
        assert_eq!(adapter.process(&object, None).await.unwrap(), Status::Ok);

        let anonymous = FileObject::new(&path, ObjectKind::File, ObjectMetadata::default());
        assert_eq!(adapter.process(&anonymous, None).await.unwrap(), Status::Fail);

        let mut other = MemoryAdapter::new(stores.store("db"));
        other.connect().await;
        let uids: BTreeSet<String> = ["1.1", "9.9"].into_iter().map(String::from).collect();
        let found = other.uid_query(&uids).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["1.1"].digest.len(), 64);
    }

    #[tokio::test]
    async fn test_unavailable_store_refuses_connection() {
        let store = Arc::new(MemoryStore::default());
        store.set_available(false);
        let mut adapter = MemoryAdapter::new(store);
        assert_eq!(adapter.connect().await, Status::Retry);
    }
}
