//! Storage stage: keeps a copy of every object in a file system / study tree,
//! optionally serves it over HTTP and expires old studies.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_common::{
    Acceptance, FileObject, PipelineError, PipelineStage, Quarantine, StageState, StageStats,
    StageStatus, StorageService, Stored,
};
use tracing::{info, warn};

use super::StageEnv;
use crate::Result;
use crate::config::StageConfig;
use crate::server::routes::storage::{StorageState, router};
use crate::server::{BasicAuth, HttpServer, HttpServerConfig, TlsFiles};
use crate::storage::{FileSystemManager, StorageMonitor, StoredObject};

pub struct FileStorageService {
    id: String,
    name: String,
    manager: Arc<FileSystemManager>,
    fs_name_tag: Option<String>,
    return_stored_file: bool,
    acceptance: Acceptance,
    quarantine: Option<Arc<Quarantine>>,
    /// Base of the URLs handed out for stored objects.
    base_url: String,
    port: Option<u16>,
    tls: Option<TlsFiles>,
    auth: Arc<BasicAuth>,
    require_authentication: bool,
    monitor: Option<Arc<StorageMonitor>>,
    server: Mutex<Option<Arc<HttpServer>>>,
    last_stored: Mutex<Option<String>>,
    stats: Arc<StageStats>,
}

impl FileStorageService {
    pub const CLASS: &'static str = "FileStorageService";

    /// Attributes: `root`, `fsNameTag`, `returnStoredFile` (yes),
    /// `acceptDuplicates` (yes), `port`, `ssl`, `requireAuthentication`,
    /// `timeDepth` (days) and `quarantine`.
    pub async fn from_config(config: &StageConfig, env: &StageEnv) -> Result<Self> {
        let manager = Arc::new(
            FileSystemManager::open(config.root()?, config.flag("acceptDuplicates", true)).await?,
        );
        let port = config.port();
        let tls = env.tls(config);
        let scheme = if tls.is_some() { "https" } else { "http" };
        let base_url = format!(
            "{}://{}:{}/storage",
            scheme,
            env.host,
            port.unwrap_or(env.server.port)
        );

        let mut stage = Self::new(config.id(), config.name(), manager, base_url);
        stage.fs_name_tag = config.attr("fsNameTag").map(str::to_string);
        stage.return_stored_file = config.flag("returnStoredFile", true);
        stage.acceptance = config.acceptance();
        stage.port = port;
        stage.tls = tls;
        stage.auth = env.auth.clone();
        stage.require_authentication = env.require_authentication(config);
        if let Some(dir) = config.quarantine() {
            stage.quarantine = Some(Arc::new(Quarantine::open(dir).await?));
        }
        if config.time_depth() > 0 {
            stage.monitor = Some(Arc::new(StorageMonitor::new(
                stage.manager.clone(),
                config.time_depth(),
            )));
        }
        Ok(stage)
    }

    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        manager: Arc<FileSystemManager>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            manager,
            fs_name_tag: None,
            return_stored_file: true,
            acceptance: Acceptance::default(),
            quarantine: None,
            base_url: base_url.into(),
            port: None,
            tls: None,
            auth: Arc::new(BasicAuth::default()),
            require_authentication: false,
            monitor: None,
            server: Mutex::new(None),
            last_stored: Mutex::new(None),
            stats: StageStats::new(),
        }
    }

    pub fn with_fs_name_tag(mut self, tag: impl Into<String>) -> Self {
        self.fs_name_tag = Some(tag.into());
        self
    }

    pub fn with_return_stored_file(mut self, enabled: bool) -> Self {
        self.return_stored_file = enabled;
        self
    }

    pub fn with_quarantine(mut self, quarantine: Arc<Quarantine>) -> Self {
        self.quarantine = Some(quarantine);
        self
    }

    pub fn manager(&self) -> &Arc<FileSystemManager> {
        &self.manager
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Address of the storage server once started.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.lock().as_ref().map(|server| server.local_addr())
    }

    /// File system an object belongs to, from the `fsNameTag` attribute.
    pub fn file_system_name(&self, object: &FileObject) -> String {
        let raw = self
            .fs_name_tag
            .as_deref()
            .and_then(|tag| object.attribute(tag));
        FileSystemManager::file_system_name(raw)
    }

    /// The stored copy of `object` named `filename`, if it exists.
    pub fn get_stored_object(&self, object: &FileObject, filename: &str) -> Option<StoredObject> {
        self.manager
            .locate(&self.file_system_name(object), object.study_uid(), filename)
            .map(|location| location.into_stored_object(&self.base_url))
    }

    async fn quarantine_copy(&self, object: &FileObject) {
        if let Some(quarantine) = &self.quarantine
            && let Err(e) = quarantine.insert_copy(object.path()).await
        {
            warn!(stage = %self.name, error = %e, "Unable to quarantine object");
        }
    }
}

#[async_trait]
impl PipelineStage for FileStorageService {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn acceptance(&self) -> Acceptance {
        self.acceptance
    }

    fn quarantine(&self) -> Option<&Quarantine> {
        self.quarantine.as_deref()
    }

    async fn start(&self) -> pipeline_common::Result<()> {
        if !self.stats.try_start() {
            return Ok(());
        }
        if let Some(monitor) = &self.monitor {
            monitor.start();
        }
        if let Some(port) = self.port {
            let router = router(StorageState {
                manager: self.manager.clone(),
                auth: self.auth.clone(),
                require_authentication: self.require_authentication,
            });
            let config = HttpServerConfig::new(port).with_tls(self.tls.clone());
            let server = HttpServer::start(format!("{} storage", self.name), config, router)
                .await
                .map_err(|e| PipelineError::Config(format!("{}: {}", self.name, e)))?;
            *self.server.lock() = Some(Arc::new(server));
        }
        info!("Started {} at {}", self.name, self.manager.root().display());
        Ok(())
    }

    async fn shutdown(&self) {
        self.stats.set_state(StageState::Stopping);
        if let Some(monitor) = &self.monitor {
            monitor.shutdown();
        }
        let server = self.server.lock().clone();
        if let Some(server) = server {
            server.shutdown().await;
        }
        self.is_down();
    }

    fn is_down(&self) -> bool {
        let server_down = self.server.lock().as_ref().is_none_or(|s| s.is_down());
        let monitor_down = self.monitor.as_ref().is_none_or(|m| m.is_down());
        let down = server_down && monitor_down && self.stats.state() != StageState::Running;
        if down && self.stats.state() == StageState::Stopping {
            self.stats.set_state(StageState::Stopped);
        }
        down
    }

    fn status(&self) -> StageStatus {
        let mut status = self
            .stats
            .snapshot(&self.id, &self.name, Self::CLASS)
            .with_quarantine(self.quarantine.as_deref())
            .with_detail("root", self.manager.root().display())
            .with_detail("file_systems", self.manager.file_systems().len());
        if let Some(monitor) = &self.monitor {
            status = status.with_detail("time_depth_days", monitor.time_depth().as_secs() / 86_400);
        }
        if let Some(addr) = self.local_addr() {
            status = status.with_detail("address", addr);
        }
        if let Some(last) = self.last_stored.lock().clone() {
            status = status.with_detail("last_stored", last);
        }
        status
    }
}

#[async_trait]
impl StorageService for FileStorageService {
    /// A failure while the object is still readable is a storage problem and
    /// asks for a retry; an object that can no longer be read is rejected.
    async fn store(&self, object: FileObject) -> Stored {
        let started = Instant::now();
        self.stats.record_in(object.file_name());
        let file_system = self.file_system_name(&object);

        match self.manager.store(&file_system, &object).await {
            Ok(location) => {
                *self.last_stored.lock() = Some(location.url(&self.base_url));
                self.stats.record_out(started.elapsed());
                if self.return_stored_file {
                    Stored::Object(object.with_path(location.file))
                } else {
                    Stored::Object(object)
                }
            }
            Err(e) if tokio::fs::try_exists(object.path()).await.unwrap_or(false) => {
                warn!(stage = %self.name, object = %object.file_name(), error = %e, "Unable to store object; will retry");
                self.stats.record_retry();
                Stored::Retry
            }
            Err(e) => {
                warn!(stage = %self.name, object = %object.file_name(), error = %e, "Object rejected by storage");
                self.stats.record_failure();
                self.quarantine_copy(&object).await;
                Stored::Rejected
            }
        }
    }
}
