//! Pull import: polls a peer for queued files over a small TCP protocol.
//!
//! Per connection the peer sends a 4-byte little-endian length (0 when it has
//! nothing) followed by that many bytes. The importer writes the content to a
//! hidden file in its queue directory, enqueues it, and answers with one byte:
//! 1 when the object was stored, 0 otherwise. After a successful pull the
//! peer is polled again at once; after an empty or failed poll the worker
//! sleeps for the configured interval.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_common::{
    FileObject, ImportService, PipelineStage, Quarantine, QueueManager, StageState,
    StageStatus, sleep_or_cancel,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StageEnv;
use super::import::ImportQueue;
use crate::config::StageConfig;
use crate::{Error, Result};

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PollingImportService {
    id: String,
    name: String,
    address: String,
    interval: Duration,
    io_timeout: Duration,
    import: Arc<ImportQueue>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingImportService {
    pub const CLASS: &'static str = "PollingImportService";

    pub async fn from_config(config: &StageConfig, env: &StageEnv) -> Result<Self> {
        let url = config
            .attr("url")
            .ok_or_else(|| Error::config(format!("{}: missing url attribute", config.name())))?;
        let import = ImportQueue::open(config, env).await?;
        Ok(Self::new(config.id(), config.name(), url, import).with_interval(config.interval()))
    }

    /// `address` is `host:port`; a leading `scheme://` is ignored.
    pub(crate) fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: &str,
        import: ImportQueue,
    ) -> Self {
        let address = address
            .split_once("://")
            .map_or(address, |(_, rest)| rest)
            .trim_end_matches('/')
            .to_string();
        Self {
            id: id.into(),
            name: name.into(),
            address,
            interval: Duration::from_millis(pipeline_common::ExportConfig::DEFAULT_INTERVAL_MS),
            io_timeout: DEFAULT_IO_TIMEOUT,
            import: Arc::new(import),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.import.queue
    }
}

#[async_trait]
impl PipelineStage for PollingImportService {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn acceptance(&self) -> pipeline_common::Acceptance {
        self.import.acceptance
    }

    fn quarantine(&self) -> Option<&Quarantine> {
        self.import.quarantine.as_deref()
    }

    async fn start(&self) -> pipeline_common::Result<()> {
        if !self.import.stats.try_start() {
            return Ok(());
        }
        let puller = Puller {
            stage: self.name.clone(),
            address: self.address.clone(),
            interval: self.interval,
            io_timeout: self.io_timeout,
            queue: self.import.queue.clone(),
            cancel: self.cancel.clone(),
        };
        *self.task.lock() = Some(tokio::spawn(puller.run()));
        info!("Started {} polling {} every {:?}", self.name, self.address, self.interval);
        Ok(())
    }

    async fn shutdown(&self) {
        if self.import.stats.state() == StageState::Running {
            self.import.stats.set_state(StageState::Stopping);
        }
        self.cancel.cancel();
        if self.task.lock().is_none() {
            self.import.stats.set_state(StageState::Stopped);
        }
    }

    fn is_down(&self) -> bool {
        let down = self
            .task
            .lock()
            .as_ref()
            .is_none_or(|handle| handle.is_finished());
        if down && self.import.stats.state() == StageState::Stopping {
            self.import.stats.set_state(StageState::Stopped);
        }
        down
    }

    fn status(&self) -> StageStatus {
        self.import
            .stats
            .snapshot(&self.id, &self.name, Self::CLASS)
            .with_queue_size(self.import.queue.size())
            .with_quarantine(self.import.quarantine.as_deref())
            .with_detail("peer", &self.address)
    }
}

#[async_trait]
impl ImportService for PollingImportService {
    async fn next_object(&self) -> Option<FileObject> {
        self.import.next_object(&self.name).await
    }

    async fn release(&self, path: &Path) {
        self.import.release(&self.name, path).await;
    }

    async fn return_object(&self, path: &Path) {
        self.import.return_object(&self.name, path);
    }
}

struct Puller {
    stage: String,
    address: String,
    interval: Duration,
    io_timeout: Duration,
    queue: Arc<QueueManager>,
    cancel: CancellationToken,
}

impl Puller {
    async fn run(self) {
        debug!(stage = %self.stage, "Pull worker started");
        loop {
            let pulled = tokio::select! {
                _ = self.cancel.cancelled() => break,
                pulled = self.pull_once() => pulled,
            };
            match pulled {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => debug!(stage = %self.stage, peer = %self.address, error = %e, "Pull failed"),
            }
            if !sleep_or_cancel(&self.cancel, self.interval).await {
                break;
            }
        }
        debug!(stage = %self.stage, "Pull worker stopped");
    }

    /// One connection to the peer. Returns true when an object was received.
    async fn pull_once(&self) -> Result<bool> {
        let mut stream = self
            .timed("connecting", TcpStream::connect(self.address.as_str()))
            .await?;

        let mut header = [0u8; 4];
        self.timed("reading length", stream.read_exact(&mut header))
            .await?;
        let length = u32::from_le_bytes(header);
        if length == 0 {
            return Ok(false);
        }

        let temp = self.queue.temp_path();
        let received = match self.receive(&mut stream, &temp, length).await {
            Ok(()) => {
                let name = format!("pulled-{}", uuid::Uuid::new_v4().simple());
                self.queue
                    .enqueue_temp(&temp, &name)
                    .await
                    .map_err(Error::from)
            }
            Err(e) => Err(e),
        };
        if received.is_err() {
            let _ = tokio::fs::remove_file(&temp).await;
        }

        let ack = [u8::from(received.is_ok())];
        if let Err(e) = stream.write_all(&ack).await {
            warn!(stage = %self.stage, peer = %self.address, error = %e, "Unable to acknowledge pull");
        }
        let _ = stream.shutdown().await;

        let entry = received?;
        debug!(stage = %self.stage, entry = %entry.display(), bytes = length, "Pulled object");
        Ok(true)
    }

    async fn receive(&self, stream: &mut TcpStream, temp: &Path, length: u32) -> Result<()> {
        let mut file = tokio::fs::File::create(temp)
            .await
            .map_err(|e| Error::io_path("creating", temp, e))?;
        let mut body = (&mut *stream).take(u64::from(length));
        let copied = self
            .timed("receiving", tokio::io::copy(&mut body, &mut file))
            .await?;
        if copied != u64::from(length) {
            return Err(Error::Other(format!(
                "peer sent {} of {} bytes",
                copied, length
            )));
        }
        file.sync_all()
            .await
            .map_err(|e| Error::io_path("syncing", temp, e))?;
        Ok(())
    }

    async fn timed<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = std::io::Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Other(format!(
                "{} {}: timed out after {:?}",
                what, self.address, self.io_timeout
            ))),
        }
    }
}
