//! Pooled export into a database, plus the verifier answering which objects
//! have been recorded.
//!
//! ```xml
//! <ExportService class="DatabaseExportService" id="db" root="roots/db"
//!                adapterClass="sqlite" poolSize="4"
//!                fileStorageServiceID="store" port="9191"/>
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_common::{
    AdapterError, AdapterFactory, ExportAdapter, ExportService, FileObject, PipelineError,
    PipelineStage, PoolConfig, PooledExportService, Quarantine, QueueManager, RetryPolicy,
    StageStatus, Status,
};
use tracing::{debug, info, warn};

use super::{FileStorageService, StageEnv};
use crate::adapters::{AdapterRegistry, DatabaseAdapter, UidRecord};
use crate::config::StageConfig;
use crate::server::routes::verifier::{self, UidLookup, VerifierState};
use crate::server::{BasicAuth, HttpServer, HttpServerConfig, TlsFiles};
use crate::storage::{StoredObject, stored_file_name};
use crate::{Error, Result};

/// Consecutive retries a worker tolerates before backing off.
const DEFAULT_RETRY_LIMIT: u32 = 0;

type StorageLink = Arc<OnceLock<Arc<FileStorageService>>>;

/// Worker adapter: resolves the stored copy of an object, then records it.
pub struct StorageAwareAdapter {
    adapter: Box<dyn DatabaseAdapter>,
    storage: StorageLink,
}

impl StorageAwareAdapter {
    fn stored_object(&self, object: &FileObject) -> Option<StoredObject> {
        let storage = self.storage.get()?;
        storage
            .get_stored_object(object, object.file_name())
            .or_else(|| storage.get_stored_object(object, &stored_file_name(object)))
    }
}

#[async_trait]
impl ExportAdapter for StorageAwareAdapter {
    async fn connect(&mut self) -> Status {
        self.adapter.connect().await
    }

    async fn process(&mut self, object: &FileObject) -> std::result::Result<Status, AdapterError> {
        let stored = self.stored_object(object);
        if stored.is_none() && self.storage.get().is_some() {
            debug!(object = %object.file_name(), "No stored copy found");
        }
        Ok(self.adapter.process(object, stored.as_ref()).await?)
    }

    async fn disconnect(&mut self) {
        self.adapter.disconnect().await;
    }

    async fn shutdown(&mut self) {
        self.adapter.shutdown().await;
    }
}

/// Answers verifier queries with a short-lived adapter per request.
struct AdapterLookup {
    adapters: Arc<AdapterRegistry>,
    class: String,
    config: StageConfig,
}

#[async_trait]
impl UidLookup for AdapterLookup {
    async fn lookup(&self, uids: &BTreeSet<String>) -> Result<BTreeMap<String, UidRecord>> {
        let mut adapter = self.adapters.create(&self.class, &self.config)?;
        if !adapter.connect().await.is_ok() {
            return Err(Error::Database(format!("unable to connect {} adapter", self.class)));
        }
        let result = adapter.uid_query(uids).await;
        adapter.disconnect().await;
        adapter.shutdown().await;
        result
    }
}

pub struct DatabaseExportService {
    pool: PooledExportService<StorageAwareAdapter>,
    storage_id: Option<String>,
    storage: StorageLink,
    lookup: Arc<dyn UidLookup>,
    port: Option<u16>,
    tls: Option<TlsFiles>,
    auth: Arc<BasicAuth>,
    require_authentication: bool,
    server: Mutex<Option<Arc<HttpServer>>>,
}

impl DatabaseExportService {
    pub const CLASS: &'static str = "DatabaseExportService";

    /// Attributes: `root`, `adapterClass` (required), `poolSize`,
    /// `fileStorageServiceID`, `retryLimit`, `port`, `ssl`,
    /// `requireAuthentication`, `quarantine` plus the common export tunables.
    /// Adapter-specific attributes (e.g. `database`) are read by the adapter.
    pub async fn from_config(config: &StageConfig, env: &StageEnv) -> Result<Self> {
        let class = config
            .attr("adapterClass")
            .ok_or_else(|| Error::config(format!("{}: missing adapterClass attribute", config.id())))?
            .to_string();
        if !env.adapters.contains(&class) {
            return Err(Error::config(format!(
                "{}: unknown adapter class '{}'",
                config.id(),
                class
            )));
        }

        let retry_limit = config
            .int("retryLimit")
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(DEFAULT_RETRY_LIMIT);
        let pool_config = PoolConfig::default()
            .with_pool_size(config.pool_size())
            .with_export(config.export_config().with_retry(RetryPolicy::new(retry_limit)));

        let storage: StorageLink = Arc::new(OnceLock::new());
        let factory: AdapterFactory<StorageAwareAdapter> = {
            let adapters = env.adapters.clone();
            let class = class.clone();
            let config = config.clone();
            let storage = storage.clone();
            Arc::new(move || {
                let adapter = adapters.create(&class, &config)?;
                Ok(StorageAwareAdapter {
                    adapter,
                    storage: storage.clone(),
                })
            })
        };

        let queue = Arc::new(QueueManager::open(config.root()?.join("queue")).await?);
        let mut pool = PooledExportService::new(config.id(), config.name(), queue, factory, pool_config)
            .with_kind(Self::CLASS)
            .with_inspector(env.inspector.clone())
            .with_acceptance(config.acceptance());
        if let Some(dir) = config.quarantine() {
            pool = pool.with_quarantine(Arc::new(Quarantine::open(dir).await?));
        }

        Ok(Self {
            pool,
            storage_id: config.attr("fileStorageServiceID").map(str::to_string),
            storage,
            lookup: Arc::new(AdapterLookup {
                adapters: env.adapters.clone(),
                class,
                config: config.clone(),
            }),
            port: config.port(),
            tls: env.tls(config),
            auth: env.auth.clone(),
            require_authentication: env.require_authentication(config),
            server: Mutex::new(None),
        })
    }

    /// Id of the file storage stage this export resolves stored copies through.
    pub fn storage_id(&self) -> Option<&str> {
        self.storage_id.as_deref()
    }

    /// Attach the referenced file storage. Only the first call has an effect.
    pub fn link_storage(&self, storage: Arc<FileStorageService>) {
        if self.storage.set(storage).is_err() {
            debug!("{}: file storage already linked", self.pool.name());
        }
    }

    pub fn is_linked(&self) -> bool {
        self.storage.get().is_some()
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        self.pool.queue()
    }

    pub fn active_workers(&self) -> usize {
        self.pool.active_workers()
    }

    /// Query the database directly, as the verifier does.
    pub async fn uid_query(&self, uids: &BTreeSet<String>) -> Result<BTreeMap<String, UidRecord>> {
        self.lookup.lookup(uids).await
    }

    /// Address of the verifier once started.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.lock().as_ref().map(|server| server.local_addr())
    }
}

#[async_trait]
impl PipelineStage for DatabaseExportService {
    fn id(&self) -> &str {
        self.pool.id()
    }

    fn name(&self) -> &str {
        self.pool.name()
    }

    fn acceptance(&self) -> pipeline_common::Acceptance {
        self.pool.acceptance()
    }

    fn quarantine(&self) -> Option<&Quarantine> {
        self.pool.quarantine()
    }

    async fn start(&self) -> pipeline_common::Result<()> {
        if let Some(id) = &self.storage_id
            && !self.is_linked()
        {
            warn!("{}: file storage '{}' is not available", self.name(), id);
        }
        self.pool.start().await?;

        if let Some(port) = self.port
            && self.server.lock().is_none()
        {
            let router = verifier::router(VerifierState {
                lookup: self.lookup.clone(),
                auth: self.auth.clone(),
                require_authentication: self.require_authentication,
            });
            let config = HttpServerConfig::new(port).with_tls(self.tls.clone());
            let server = HttpServer::start(format!("{} verifier", self.name()), config, router)
                .await
                .map_err(|e| PipelineError::Config(format!("{}: {}", self.name(), e)))?;
            *self.server.lock() = Some(Arc::new(server));
            info!("{}: verifier started", self.name());
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let server = self.server.lock().clone();
        if let Some(server) = server {
            server.shutdown().await;
        }
        self.pool.shutdown().await;
    }

    fn is_down(&self) -> bool {
        let server_down = self.server.lock().as_ref().is_none_or(|s| s.is_down());
        server_down && self.pool.is_down()
    }

    fn status(&self) -> StageStatus {
        let mut status = self.pool.status();
        if let Some(id) = &self.storage_id {
            status = status.with_detail("file_storage", id);
        }
        if let Some(addr) = self.local_addr() {
            status = status.with_detail("verifier", addr);
        }
        status
    }
}

#[async_trait]
impl ExportService for DatabaseExportService {
    async fn enqueue(&self, object: &FileObject) -> pipeline_common::Result<()> {
        self.pool.enqueue(object).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryAdapter;
    use crate::config::StageRole;
    use crate::storage::FileSystemManager;
    use pipeline_common::{ObjectKind, ObjectMetadata, StorageService};
    use std::time::Duration;
    use tempfile::TempDir;

    fn env() -> StageEnv {
        StageEnv::new("router", Default::default(), Arc::new(BasicAuth::default()))
    }

    fn config(dir: &TempDir) -> StageConfig {
        StageConfig::new(StageRole::Export, "db")
            .with_attr("class", DatabaseExportService::CLASS)
            .with_attr("root", dir.path().join("db").to_string_lossy())
            .with_attr("adapterClass", "memory")
            .with_attr("database", "exports")
            .with_attr("poolSize", "3")
            .with_attr("interval", "1000")
    }

    async fn object(dir: &TempDir, uid: &str) -> FileObject {
        let path = dir.path().join(format!("{uid}.xml"));
        tokio::fs::write(&path, format!("<obj uid=\"{uid}\" studyUID=\"s1\"/>"))
            .await
            .unwrap();
        FileObject::new(
            path,
            ObjectKind::Xml,
            ObjectMetadata::default().with_uid(uid).with_study_uid("s1"),
        )
    }

    #[tokio::test]
    async fn test_unknown_adapter_class_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir).with_attr("adapterClass", "oracle");
        let err = DatabaseExportService::from_config(&config, &env()).await.err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_objects_are_recorded_with_their_stored_url() {
        let dir = TempDir::new().unwrap();
        let env = env();
        let stage = DatabaseExportService::from_config(&config(&dir), &env).await.unwrap();

        let manager = Arc::new(FileSystemManager::open(dir.path().join("store"), true).await.unwrap());
        let storage = Arc::new(FileStorageService::new(
            "store",
            "Storage",
            manager,
            "http://router:9090/storage",
        ));
        stage.link_storage(storage.clone());
        assert!(stage.is_linked());

        let stored = storage.store(object(&dir, "1.1").await).await.object().unwrap();
        stage.enqueue(&stored).await.unwrap();
        stage.enqueue(&object(&dir, "2.2").await).await.unwrap();
        stage.start().await.unwrap();

        let records = env.adapters.memory_store("exports");
        tokio::time::timeout(Duration::from_secs(10), async {
            while records.len() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let uids: BTreeSet<String> = ["1.1", "2.2", "3.3"].into_iter().map(String::from).collect();
        let found = stage.uid_query(&uids).await.unwrap();
        assert_eq!(found.keys().collect::<Vec<_>>(), vec!["1.1", "2.2"]);
        assert!(records.get("1.1").is_some());

        // queue entries carry the stored name after their sequence prefix
        let adapter = StorageAwareAdapter {
            adapter: Box::new(MemoryAdapter::new(records.clone())),
            storage: stage.storage.clone(),
        };
        let queued = stored.with_path(dir.path().join("0000000000000007_1.1.xml"));
        assert_eq!(
            adapter.stored_object(&queued).map(|s| s.url),
            Some("http://router:9090/storage/__default/s1/1.1.xml".to_string())
        );

        stage.shutdown().await;
        tokio::time::timeout(Duration::from_secs(10), async {
            while !stage.is_down() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(stage.active_workers(), 0);
    }
}
