//! Concrete pipeline stages and the factory building them from configuration.
//!
//! A stage is selected by its role (the configuration element) and its
//! `class` attribute. Construction happens for every stage of every pipeline
//! before anything starts, so a link pass can then resolve references between
//! stages (`fileStorageServiceID`).

pub mod blacklist;
pub mod database_export;
pub mod directory_import;
pub mod file_storage;
pub mod http_export;
pub mod import;
pub mod polling_import;

use std::collections::HashMap;
use std::sync::Arc;

use pipeline_common::{BasicInspector, ObjectInspector, Pipeline, PipelineStage, StageHandle};
use tracing::{error, info, warn};

pub use blacklist::BlackListFilter;
pub use database_export::DatabaseExportService;
pub use directory_import::DirectoryImportService;
pub use file_storage::FileStorageService;
pub use http_export::{HttpExportService, HttpExporter};
pub use polling_import::PollingImportService;

use crate::adapters::AdapterRegistry;
use crate::config::{AppConfig, ServerConfig, StageConfig, StageRole};
use crate::server::{BasicAuth, TlsFiles};
use crate::{Error, Result};

/// Process-wide collaborators handed to every stage constructor.
#[derive(Clone)]
pub struct StageEnv {
    /// Host name used in URLs handed to other systems.
    pub host: String,
    pub server: ServerConfig,
    pub auth: Arc<BasicAuth>,
    pub adapters: Arc<AdapterRegistry>,
    pub inspector: Arc<dyn ObjectInspector>,
}

impl StageEnv {
    pub fn new(host: impl Into<String>, server: ServerConfig, auth: Arc<BasicAuth>) -> Self {
        Self {
            host: host.into(),
            server,
            auth,
            adapters: Arc::new(AdapterRegistry::with_defaults()),
            inspector: Arc::new(BasicInspector),
        }
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = Arc::new(adapters);
        self
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn ObjectInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    /// Certificate files for a stage server with `ssl="yes"`.
    pub fn tls(&self, config: &StageConfig) -> Option<TlsFiles> {
        if !config.flag("ssl", false) {
            return None;
        }
        match (&self.server.certificate, &self.server.private_key) {
            (Some(certificate), Some(private_key)) => Some(TlsFiles {
                certificate: certificate.clone(),
                private_key: private_key.clone(),
            }),
            _ => {
                warn!(
                    "{}: ssl requested but the server has no certificate; serving plain HTTP",
                    config.name()
                );
                None
            }
        }
    }

    /// Authentication requirement of a stage server; the stage attribute wins
    /// over the `<Server>` default.
    pub fn require_authentication(&self, config: &StageConfig) -> bool {
        config.flag("requireAuthentication", self.server.require_authentication)
    }
}

/// A constructed stage, plus typed handles the link pass and the context need.
pub struct BuiltStage {
    pub handle: StageHandle,
    pub storage: Option<Arc<FileStorageService>>,
    pub database: Option<Arc<DatabaseExportService>>,
}

impl BuiltStage {
    fn plain(handle: StageHandle) -> Self {
        Self {
            handle,
            storage: None,
            database: None,
        }
    }
}

/// Maps `(role, class)` to a stage constructor.
pub struct StageFactory;

impl StageFactory {
    pub async fn build(config: &StageConfig, env: &StageEnv) -> Result<BuiltStage> {
        let class = config.class();
        let stage = match (config.role, class) {
            (StageRole::Import, PollingImportService::CLASS) => BuiltStage::plain(StageHandle::Import(
                Arc::new(PollingImportService::from_config(config, env).await?),
            )),
            (StageRole::Import, DirectoryImportService::CLASS) => BuiltStage::plain(StageHandle::Import(
                Arc::new(DirectoryImportService::from_config(config, env).await?),
            )),
            (StageRole::Processor, BlackListFilter::CLASS) => BuiltStage::plain(StageHandle::Processor(
                Arc::new(BlackListFilter::from_config(config, env).await?),
            )),
            (StageRole::Storage, FileStorageService::CLASS) => {
                let storage = Arc::new(FileStorageService::from_config(config, env).await?);
                BuiltStage {
                    handle: StageHandle::Storage(storage.clone()),
                    storage: Some(storage),
                    database: None,
                }
            }
            (StageRole::Export, http_export::CLASS) => BuiltStage::plain(StageHandle::Export(
                Arc::new(http_export::from_config(config, env).await?),
            )),
            (StageRole::Export, DatabaseExportService::CLASS) => {
                let database = Arc::new(DatabaseExportService::from_config(config, env).await?);
                BuiltStage {
                    handle: StageHandle::Export(database.clone()),
                    storage: None,
                    database: Some(database),
                }
            }
            (role, class) => {
                return Err(Error::config(format!(
                    "{}: unknown {:?} class '{}'",
                    config.id(),
                    role,
                    class
                )));
            }
        };
        Ok(stage)
    }
}

/// Every pipeline of the configuration with its stages constructed and linked.
pub struct BuiltPipelines {
    pub pipelines: Vec<Pipeline>,
    /// Stage handles keyed by stage id.
    pub stages: HashMap<String, StageHandle>,
}

/// Construct the stages of every pipeline.
///
/// A stage that cannot be constructed is logged and left out of its pipeline;
/// a pipeline whose import stage cannot be constructed is skipped entirely.
pub async fn build_pipelines(config: &AppConfig, env: &StageEnv) -> BuiltPipelines {
    let mut storages: HashMap<String, Arc<FileStorageService>> = HashMap::new();
    let mut databases: Vec<(String, Arc<DatabaseExportService>)> = Vec::new();
    let mut stages = HashMap::new();
    let mut pipelines = Vec::new();

    for pipeline_config in &config.pipelines {
        let mut pipeline = Pipeline::new(&pipeline_config.name);
        let mut has_import = false;
        let mut built_stages = Vec::new();

        for (index, stage_config) in pipeline_config.stages.iter().enumerate() {
            let built = match StageFactory::build(stage_config, env).await {
                Ok(built) => built,
                Err(e) => {
                    error!(
                        "Pipeline '{}': unable to create stage '{}': {}",
                        pipeline_config.name,
                        stage_config.name(),
                        e
                    );
                    continue;
                }
            };
            if index == 0 {
                has_import = matches!(built.handle, StageHandle::Import(_));
            }
            pipeline = pipeline.add_stage(built.handle.clone());
            built_stages.push((stage_config.id().to_string(), built));
        }

        if !has_import {
            error!(
                "Pipeline '{}' has no usable import service; skipping it",
                pipeline_config.name
            );
            continue;
        }
        for (id, built) in built_stages {
            if let Some(storage) = built.storage {
                storages.insert(id.clone(), storage);
            }
            if let Some(database) = built.database {
                databases.push((pipeline_config.name.clone(), database));
            }
            stages.insert(id, built.handle);
        }
        info!(
            "Pipeline '{}' built with {} stages",
            pipeline_config.name,
            pipeline.stages().len()
        );
        pipelines.push(pipeline);
    }

    for (pipeline, database) in databases {
        let Some(id) = database.storage_id() else {
            continue;
        };
        match storages.get(id) {
            Some(storage) => database.link_storage(storage.clone()),
            None => warn!(
                "Pipeline '{}': stage '{}' references unknown file storage '{}'",
                pipeline,
                database.name(),
                id
            ),
        }
    }

    BuiltPipelines { pipelines, stages }
}
