//! Export stage posting every object to an HTTP endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline_common::{
    Exporter, FileObject, ObjectKind, Quarantine, QueueManager, QueuedExportService, Status,
};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::StageEnv;
use crate::config::StageConfig;
use crate::server::tls::install_crypto_provider;
use crate::{Error, Result};

pub const CLASS: &str = "HttpExportService";

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Single-worker export stage built on [`HttpExporter`].
pub type HttpExportService = QueuedExportService<HttpExporter>;

/// Posts objects to `url`, one request per object.
pub struct HttpExporter {
    client: Client,
    url: String,
    credentials: Option<(String, String)>,
}

impl HttpExporter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        install_crypto_provider();
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            credentials: None,
        })
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Map a response status to the outcome of the export.
    ///
    /// Client errors are permanent except for timeouts and rate limiting;
    /// everything else is worth retrying.
    pub fn classify(status: StatusCode) -> Status {
        if status.is_success() {
            Status::Ok
        } else if status.is_client_error()
            && status != StatusCode::REQUEST_TIMEOUT
            && status != StatusCode::TOO_MANY_REQUESTS
        {
            Status::Fail
        } else {
            Status::Retry
        }
    }
}

fn content_type(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Dicom => "application/dicom",
        ObjectKind::Xml => "application/xml",
        ObjectKind::Zip => "application/zip",
        ObjectKind::File => "application/octet-stream",
    }
}

#[async_trait]
impl Exporter for HttpExporter {
    async fn export(&self, object: &FileObject) -> Status {
        let file = match tokio::fs::File::open(object.path()).await {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %object.path().display(), error = %e, "Unable to open object for export");
                return Status::Retry;
            }
        };

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, content_type(object.kind()))
            .header(
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", object.file_name().replace('"', "_")),
            )
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let outcome = Self::classify(status);
                if outcome.is_ok() {
                    debug!(object = %object.file_name(), url = %self.url, "Exported");
                } else {
                    warn!(object = %object.file_name(), url = %self.url, status = %status, "Export rejected");
                }
                outcome
            }
            Err(e) => {
                warn!(object = %object.file_name(), url = %self.url, error = %e, "Export request failed");
                Status::Retry
            }
        }
    }
}

/// Attributes: `root`, `url` (required), `username`/`password`, `timeout`
/// (ms) plus the common export tunables.
pub async fn from_config(config: &StageConfig, env: &StageEnv) -> Result<HttpExportService> {
    let url = config
        .attr("url")
        .ok_or_else(|| Error::config(format!("{}: missing url attribute", config.id())))?;
    let timeout = config
        .int("timeout")
        .filter(|ms| *ms > 0)
        .map(|ms| Duration::from_millis(ms as u64))
        .unwrap_or(DEFAULT_TIMEOUT);
    let mut exporter = HttpExporter::new(url, timeout)?;
    if let Some(username) = config.attr("username") {
        exporter = exporter.with_credentials(username, config.attr("password").unwrap_or_default());
    }

    let queue = Arc::new(QueueManager::open(config.root()?.join("queue")).await?);
    let mut stage = QueuedExportService::new(
        config.id(),
        config.name(),
        queue,
        exporter,
        config.export_config(),
    )
    .with_kind(CLASS)
    .with_inspector(env.inspector.clone())
    .with_acceptance(config.acceptance());
    if let Some(dir) = config.quarantine() {
        stage = stage.with_quarantine(Arc::new(Quarantine::open(dir).await?));
    }
    Ok(stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageRole;
    use crate::server::{BasicAuth, HttpServer, HttpServerConfig};
    use axum::body::Bytes;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Router, extract::State};
    use parking_lot::Mutex;
    use pipeline_common::ObjectMetadata;
    use tempfile::TempDir;

    type Received = Arc<Mutex<Vec<(String, Bytes)>>>;

    async fn sink(received: Received, status: StatusCode) -> HttpServer {
        let router = Router::new()
            .route(
                "/upload",
                post(
                    move |State(received): State<Received>, headers: HeaderMap, body: Bytes| async move {
                        let kind = headers
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        received.lock().push((kind, body));
                        status
                    },
                ),
            )
            .with_state(received);
        HttpServer::start(
            "sink",
            HttpServerConfig::new(0).with_bind_address("127.0.0.1"),
            router,
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(HttpExporter::classify(StatusCode::CREATED), Status::Ok);
        assert_eq!(HttpExporter::classify(StatusCode::BAD_REQUEST), Status::Fail);
        assert_eq!(HttpExporter::classify(StatusCode::TOO_MANY_REQUESTS), Status::Retry);
        assert_eq!(HttpExporter::classify(StatusCode::BAD_GATEWAY), Status::Retry);
    }

    #[tokio::test]
    async fn test_posts_object_body() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obj.xml");
        tokio::fs::write(&path, b"<obj uid=\"1\"/>").await.unwrap();
        let object = FileObject::new(&path, ObjectKind::Xml, ObjectMetadata::default());

        let received: Received = Arc::default();
        let server = sink(received.clone(), StatusCode::OK).await;
        let exporter = HttpExporter::new(
            format!("http://{}/upload", server.local_addr()),
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(exporter.export(&object).await, Status::Ok);
        {
            let received = received.lock();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].0, "application/xml");
            assert_eq!(&received[0].1[..], b"<obj uid=\"1\"/>");
        }
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retried() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obj");
        tokio::fs::write(&path, b"x").await.unwrap();
        let object = FileObject::new(&path, ObjectKind::File, ObjectMetadata::default());

        let server = sink(Arc::default(), StatusCode::OK).await;
        let url = format!("http://{}/upload", server.local_addr());
        server.shutdown().await;

        let exporter = HttpExporter::new(url, Duration::from_secs(2)).unwrap();
        assert_eq!(exporter.export(&object).await, Status::Retry);
    }

    #[tokio::test]
    async fn test_from_config_requires_url() {
        let dir = TempDir::new().unwrap();
        let env = StageEnv::new("localhost", Default::default(), Arc::new(BasicAuth::default()));
        let config = StageConfig::new(StageRole::Export, "http")
            .with_attr("class", CLASS)
            .with_attr("root", dir.path().to_string_lossy());
        assert!(from_config(&config, &env).await.is_err());

        let config = config.with_attr("url", "http://127.0.0.1:1/upload");
        let stage = from_config(&config, &env).await.unwrap();
        assert_eq!(stage.exporter().url(), "http://127.0.0.1:1/upload");
        assert!(dir.path().join("queue").is_dir());
    }
}
