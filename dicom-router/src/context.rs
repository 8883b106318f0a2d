//! Application context: everything built once at startup and handed by
//! reference to the components that need it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use pipeline_common::{Pipeline, StageHandle, StageStatus};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::config::AppConfig;
use crate::logging::LoggingConfig;
use crate::server::routes::{AdminState, admin_router};
use crate::server::{BasicAuth, HttpServer, HttpServerConfig, TlsFiles};
use crate::stages::{StageEnv, build_pipelines};

/// Host advertised when neither the environment nor the configuration names one.
pub const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub name: String,
    pub running: bool,
    pub stages: Vec<StageStatus>,
}

pub struct AppContext {
    config: AppConfig,
    env: StageEnv,
    start_time: Instant,
    pipelines: Vec<Pipeline>,
    stages: DashMap<String, StageHandle>,
    logging: Option<Arc<LoggingConfig>>,
    admin: Mutex<Option<Arc<HttpServer>>>,
    cancel: CancellationToken,
}

impl AppContext {
    /// `override_host` (from the command line or environment) wins over the
    /// `address` of the `<Server>` element.
    pub fn resolve_host(config: &AppConfig, override_host: Option<&str>) -> String {
        override_host
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .or(config.server.address.as_deref())
            .unwrap_or(DEFAULT_HOST)
            .to_string()
    }

    /// Build every pipeline with the default adapters.
    pub async fn build(config: AppConfig, override_host: Option<&str>) -> Self {
        let host = Self::resolve_host(&config, override_host);
        let auth = Arc::new(BasicAuth::new(&config.users));
        let env = StageEnv::new(host, config.server.clone(), auth);
        Self::build_with_env(config, env).await
    }

    /// Build every pipeline with caller-supplied collaborators.
    pub async fn build_with_env(config: AppConfig, env: StageEnv) -> Self {
        let built = build_pipelines(&config, &env).await;
        info!(
            pipelines = built.pipelines.len(),
            stages = built.stages.len(),
            users = env.auth.len(),
            "Configuration loaded"
        );
        Self {
            config,
            env,
            start_time: Instant::now(),
            pipelines: built.pipelines,
            stages: built.stages.into_iter().collect(),
            logging: None,
            admin: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_logging(mut self, logging: Arc<LoggingConfig>) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn host(&self) -> &str {
        &self.env.host
    }

    pub fn auth(&self) -> &BasicAuth {
        &self.env.auth
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    pub fn stage(&self, id: &str) -> Option<StageHandle> {
        self.stages.get(id).map(|s| s.value().clone())
    }

    pub fn stage_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.stages.iter().map(|s| s.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn logging(&self) -> Option<&Arc<LoggingConfig>> {
        self.logging.as_ref()
    }

    /// Address of the admin server once started.
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin.lock().as_ref().map(|server| server.local_addr())
    }

    pub fn status(&self) -> Vec<PipelineStatus> {
        self.pipelines
            .iter()
            .map(|pipeline| PipelineStatus {
                name: pipeline.name().to_string(),
                running: !pipeline.is_down(),
                stages: pipeline.status(),
            })
            .collect()
    }

    /// Start every pipeline, then the admin server.
    ///
    /// A pipeline that fails to start is logged and left stopped; only a
    /// failure to start the admin server is returned.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        for pipeline in &self.pipelines {
            if let Err(e) = pipeline.start().await {
                error!("Pipeline '{}' failed to start: {}", pipeline.name(), e);
            }
        }

        if let Some(logging) = &self.logging {
            logging.start_retention_cleanup(self.cancel.child_token());
        }

        let server = &self.config.server;
        let tls = server
            .ssl
            .then(|| server.certificate.clone().zip(server.private_key.clone()))
            .flatten()
            .map(|(certificate, private_key)| TlsFiles {
                certificate,
                private_key,
            });
        let router = admin_router(AdminState::new(self.clone()));
        let admin = HttpServer::start("Admin server", HttpServerConfig::new(server.port).with_tls(tls), router).await?;
        *self.admin.lock() = Some(Arc::new(admin));
        Ok(())
    }

    /// Ordered shutdown: admin server first, then every pipeline. Returns
    /// false if some pipeline was still running when `timeout` expired.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let admin = self.admin.lock().take();
        if let Some(admin) = admin {
            admin.shutdown().await;
        }

        for pipeline in &self.pipelines {
            pipeline.shutdown().await;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let mut all_down = true;
        for pipeline in &self.pipelines {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !pipeline.wait_down(remaining).await {
                warn!("Pipeline '{}' did not stop within {:?}", pipeline.name(), timeout);
                all_down = false;
            }
        }
        if all_down {
            info!("All pipelines stopped");
        }
        all_down
    }
}
