//! Pooled export: several workers share one queue, each with its own adapter.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::export::{ExportConfig, RetryPolicy, WorkerContext, guarded};
use crate::object::{BasicInspector, FileObject, ObjectInspector};
use crate::quarantine::Quarantine;
use crate::queue::QueueManager;
use crate::stage::{Acceptance, ExportService, PipelineStage, StageState, StageStats, StageStatus};
use crate::status::Status;

/// Error surfaced by an adapter. Errors during export are retried.
pub type AdapterError = Box<dyn std::error::Error + Send + Sync>;

/// Only this worker rescans the queue.
const RECOUNT_WORKER: usize = 0;
const RECOUNT_THRESHOLD: usize = 10;

/// Connection from one pool worker to an external system.
///
/// Each worker owns its adapter exclusively; adapters are never shared.
#[async_trait]
pub trait ExportAdapter: Send + 'static {
    async fn connect(&mut self) -> Status;

    async fn process(&mut self, object: &FileObject) -> std::result::Result<Status, AdapterError>;

    async fn disconnect(&mut self);

    /// Release everything the adapter holds. Called once when its worker exits.
    async fn shutdown(&mut self) {}
}

#[async_trait]
impl<T: ExportAdapter + ?Sized> ExportAdapter for Box<T> {
    async fn connect(&mut self) -> Status {
        (**self).connect().await
    }

    async fn process(&mut self, object: &FileObject) -> std::result::Result<Status, AdapterError> {
        (**self).process(object).await
    }

    async fn disconnect(&mut self) {
        (**self).disconnect().await
    }

    async fn shutdown(&mut self) {
        (**self).shutdown().await
    }
}

/// Builds a fresh adapter for a worker or a one-off query.
pub type AdapterFactory<A> =
    Arc<dyn Fn() -> std::result::Result<A, AdapterError> + Send + Sync + 'static>;

/// Sizing and tunables of a pooled export stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub export: ExportConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            export: ExportConfig::default().with_retry(RetryPolicy::new(0)),
        }
    }
}

impl PoolConfig {
    pub const MIN_POOL_SIZE: usize = 1;
    pub const MAX_POOL_SIZE: usize = 10;

    /// Pool size from a configured value, clamped to `[MIN_POOL_SIZE, MAX_POOL_SIZE]`.
    pub fn clamp_pool_size(size: Option<usize>) -> usize {
        size.unwrap_or(Self::MIN_POOL_SIZE)
            .clamp(Self::MIN_POOL_SIZE, Self::MAX_POOL_SIZE)
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_export(mut self, export: ExportConfig) -> Self {
        self.export = export;
        self
    }
}

/// A queued export stage drained by a fixed pool of workers.
pub struct PooledExportService<A: ExportAdapter> {
    id: String,
    name: String,
    kind: String,
    queue: Arc<QueueManager>,
    quarantine: Option<Arc<Quarantine>>,
    factory: AdapterFactory<A>,
    inspector: Arc<dyn ObjectInspector>,
    acceptance: Acceptance,
    config: PoolConfig,
    stats: Arc<StageStats>,
    active_workers: Arc<AtomicUsize>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<A: ExportAdapter> PooledExportService<A> {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        queue: Arc<QueueManager>,
        factory: AdapterFactory<A>,
        config: PoolConfig,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: "PooledExportService".to_string(),
            queue,
            quarantine: None,
            factory,
            inspector: Arc::new(BasicInspector),
            acceptance: Acceptance::default(),
            config,
            stats: StageStats::new(),
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_quarantine(mut self, quarantine: Arc<Quarantine>) -> Self {
        self.quarantine = Some(quarantine);
        self
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn ObjectInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn with_acceptance(mut self, acceptance: Acceptance) -> Self {
        self.acceptance = acceptance;
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn stats(&self) -> &Arc<StageStats> {
        &self.stats
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of workers currently running.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// A fresh adapter outside the pool, e.g. for answering queries.
    pub fn new_adapter(&self) -> std::result::Result<A, AdapterError> {
        (self.factory)()
    }
}

struct PoolWorker<A: ExportAdapter> {
    index: usize,
    ctx: Arc<WorkerContext>,
    adapter: A,
    active: Arc<AtomicUsize>,
}

impl<A: ExportAdapter> PoolWorker<A> {
    async fn run(mut self) {
        let ctx = self.ctx.clone();
        debug!("{} worker {} started", ctx.stage, self.index);
        let mut consecutive_retries = 0u32;

        while !ctx.cancel.is_cancelled() {
            if ctx.queue.size() > 0 {
                if self.adapter.connect().await.is_ok() {
                    self.drain(&ctx, &mut consecutive_retries).await;
                }
                self.adapter.disconnect().await;
            }

            if self.index == RECOUNT_WORKER && ctx.queue.size() < RECOUNT_THRESHOLD {
                if let Err(e) = ctx.queue.recount().await {
                    warn!(stage = %ctx.stage, error = %e, "Queue recount failed");
                }
            }

            if !ctx.idle().await {
                break;
            }
        }

        self.adapter.shutdown().await;
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            ctx.stats.set_state(StageState::Stopped);
        }
        debug!("{} worker {} stopped", ctx.stage, self.index);
    }

    async fn drain(&mut self, ctx: &WorkerContext, consecutive_retries: &mut u32) {
        while !ctx.cancel.is_cancelled() {
            let Some(path) = ctx.queue.next_file().await else {
                break;
            };
            let started = Instant::now();
            let status = match ctx.open(&path).await {
                Some(object) => {
                    let adapter = &mut self.adapter;
                    guarded(&ctx.stage, async move {
                        match adapter.process(&object).await {
                            Ok(status) => status,
                            Err(e) => {
                                warn!(path = %object.path().display(), error = %e, "Adapter error; will retry");
                                Status::Retry
                            }
                        }
                    })
                    .await
                }
                None => Status::Fail,
            };
            if ctx.apply(status, &path, started, consecutive_retries).await {
                break;
            }
        }
    }
}

#[async_trait]
impl<A: ExportAdapter> PipelineStage for PooledExportService<A> {
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

    async fn start(&self) -> Result<()> {
        if !self.stats.try_start() {
            return Ok(());
        }
        if !self.config.export.enabled {
            info!("{} export is disabled", self.name);
            return Ok(());
        }

        let ctx = Arc::new(WorkerContext {
            stage: self.name.clone(),
            queue: self.queue.clone(),
            quarantine: self.quarantine.clone(),
            inspector: self.inspector.clone(),
            config: self.config.export.clone(),
            stats: self.stats.clone(),
            cancel: self.cancel.clone(),
        });

        let mut tasks = self.tasks.lock();
        for index in 0..self.config.pool_size {
            let adapter = match (self.factory)() {
                Ok(adapter) => adapter,
                Err(e) => {
                    error!("{} worker {} could not create its adapter: {}", self.name, index, e);
                    continue;
                }
            };
            let worker = PoolWorker {
                index,
                ctx: ctx.clone(),
                adapter,
                active: self.active_workers.clone(),
            };
            self.active_workers.fetch_add(1, Ordering::SeqCst);
            tasks.push(tokio::spawn(worker.run()));
        }
        info!(
            "Started {} with {} of {} workers",
            self.name,
            tasks.len(),
            self.config.pool_size
        );
        Ok(())
    }

    async fn shutdown(&self) {
        if self.stats.state() == StageState::Running {
            self.stats.set_state(StageState::Stopping);
        }
        self.cancel.cancel();
        if self.tasks.lock().is_empty() {
            self.stats.set_state(StageState::Stopped);
        }
    }

    fn is_down(&self) -> bool {
        self.tasks.lock().iter().all(|handle| handle.is_finished())
    }

    fn status(&self) -> StageStatus {
        self.stats
            .snapshot(&self.id, &self.name, &self.kind)
            .with_queue_size(self.queue.size())
            .with_quarantine(self.quarantine.as_deref())
            .with_detail("workers", self.active_workers())
            .with_detail("pool_size", self.config.pool_size)
    }
}

#[async_trait]
impl<A: ExportAdapter> ExportService for PooledExportService<A> {
    async fn enqueue(&self, object: &FileObject) -> Result<()> {
        if !self.config.export.enabled || !self.accepts(object) {
            return Ok(());
        }
        self.queue.enqueue_object(object).await?;
        self.stats.record_in(object.file_name());
        Ok(())
    }
}
