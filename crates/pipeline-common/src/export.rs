//! Single-worker export stage.
//!
//! [`QueuedExportService`] drains its queue through an [`Exporter`] and applies
//! the outcome of every attempt:
//!
//! - `Ok`: throttle, release the entry, reset the consecutive-retry counter.
//! - `Retry`: move the entry to the tail of the queue. Once the consecutive
//!   retries pass the [`RetryPolicy`] threshold the worker stops draining and
//!   sleeps for the poll interval.
//! - `Fail`: quarantine the entry, or delete it when there is no quarantine.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::object::{BasicInspector, FileObject, ObjectInspector};
use crate::quarantine::Quarantine;
use crate::queue::QueueManager;
use crate::stage::{Acceptance, ExportService, PipelineStage, StageState, StageStats, StageStatus};
use crate::status::Status;

/// Queue sizes below this trigger a rescan after each drain.
const RECOUNT_THRESHOLD: usize = 20;

/// Ships one object at a time to an external system.
#[async_trait]
pub trait Exporter: Send + Sync + 'static {
    /// Prepare for a drain cycle. Anything other than `Ok` skips the cycle.
    async fn connect(&self) -> Status {
        Status::Ok
    }

    async fn export(&self, object: &FileObject) -> Status;

    /// Called after every drain cycle, including ones cut short.
    async fn disconnect(&self) {}
}

/// When a run of `Retry` results makes a worker stop draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The worker backs off once consecutive retries exceed this number.
    pub break_after: u32,
}

impl RetryPolicy {
    pub const fn new(break_after: u32) -> Self {
        Self { break_after }
    }

    pub fn should_break(&self, consecutive: u32) -> bool {
        consecutive > self.break_after
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Tunables of an export worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub enabled: bool,
    /// Sleep between drain cycles.
    pub interval: Duration,
    /// Pause after every successful export.
    pub throttle: Duration,
    pub retry: RetryPolicy,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(Self::DEFAULT_INTERVAL_MS),
            throttle: Duration::ZERO,
            retry: RetryPolicy::default(),
        }
    }
}

impl ExportConfig {
    pub const MIN_INTERVAL_MS: u64 = 1_000;
    pub const MAX_INTERVAL_MS: u64 = 10_000;
    pub const DEFAULT_INTERVAL_MS: u64 = 5_000;
    pub const MAX_THROTTLE_MS: u64 = 5_000;

    /// Poll interval from a configured value. Values outside
    /// `[MIN_INTERVAL_MS, MAX_INTERVAL_MS]` fall back to the default.
    pub fn clamp_interval(ms: Option<u64>) -> Duration {
        let ms = ms
            .filter(|ms| (Self::MIN_INTERVAL_MS..=Self::MAX_INTERVAL_MS).contains(ms))
            .unwrap_or(Self::DEFAULT_INTERVAL_MS);
        Duration::from_millis(ms)
    }

    /// Throttle from a configured value, capped at `MAX_THROTTLE_MS`.
    pub fn clamp_throttle(ms: Option<u64>) -> Duration {
        Duration::from_millis(ms.unwrap_or(0).min(Self::MAX_THROTTLE_MS))
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Sleep for `duration` unless cancelled first. Returns false on cancellation.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Open a checked-out queue entry as an object.
pub async fn open_entry(
    path: &Path,
    inspector: &dyn ObjectInspector,
) -> Option<FileObject> {
    match FileObject::open(path, inspector).await {
        Ok(object) => Some(object),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unable to read queued object");
            None
        }
    }
}

/// Quarantine a rejected entry, or delete it if the stage has no quarantine.
///
/// When the quarantine cannot take the entry it goes back to pending and
/// false is returned; the caller should back off before serving it again.
pub async fn dispose(path: &Path, queue: &QueueManager, quarantine: Option<&Quarantine>) -> bool {
    if let Some(quarantine) = quarantine {
        match quarantine.insert(path).await {
            Ok(target) => debug!(path = %target.display(), "Object quarantined"),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Unable to quarantine object; keeping it queued");
                queue.return_to_pending(path);
                return false;
            }
        }
    }
    if let Err(e) = queue.release(path).await {
        error!(path = %path.display(), error = %e, "Unable to release rejected object");
    }
    true
}

/// Run `attempt`, downgrading a panic to `Retry`.
pub(crate) async fn guarded<F>(stage: &str, attempt: F) -> Status
where
    F: std::future::Future<Output = Status>,
{
    match AssertUnwindSafe(attempt).catch_unwind().await {
        Ok(status) => status,
        Err(_) => {
            error!(stage = %stage, "Export attempt panicked; will retry");
            Status::Retry
        }
    }
}

/// Queue-side state shared by the workers of an export stage.
pub(crate) struct WorkerContext {
    pub(crate) stage: String,
    pub(crate) queue: Arc<QueueManager>,
    pub(crate) quarantine: Option<Arc<Quarantine>>,
    pub(crate) inspector: Arc<dyn ObjectInspector>,
    pub(crate) config: ExportConfig,
    pub(crate) stats: Arc<StageStats>,
    pub(crate) cancel: CancellationToken,
}

impl WorkerContext {
    /// Apply the outcome of one attempt on the entry at `path`.
    ///
    /// Returns true when the worker should stop draining.
    pub(crate) async fn apply(
        &self,
        status: Status,
        path: &Path,
        started: Instant,
        consecutive_retries: &mut u32,
    ) -> bool {
        match status {
            Status::Ok => {
                self.stats.record_out(started.elapsed());
                sleep_or_cancel(&self.cancel, self.config.throttle).await;
                if let Err(e) = self.queue.release(path).await {
                    error!(stage = %self.stage, path = %path.display(), error = %e, "Unable to release exported object");
                }
                *consecutive_retries = 0;
                false
            }
            Status::Retry => {
                self.stats.record_retry();
                if let Err(e) = self.queue.requeue(path).await {
                    error!(stage = %self.stage, path = %path.display(), error = %e, "Unable to requeue object");
                    self.queue.return_to_pending(path);
                    return true;
                }
                *consecutive_retries += 1;
                if self.config.retry.should_break(*consecutive_retries) {
                    debug!(
                        stage = %self.stage,
                        retries = *consecutive_retries,
                        "Too many consecutive retries; backing off"
                    );
                    return true;
                }
                false
            }
            Status::Fail => {
                self.stats.record_failure();
                warn!(stage = %self.stage, path = %path.display(), "Export failed permanently");
                !dispose(path, &self.queue, self.quarantine.as_deref()).await
            }
        }
    }

    pub(crate) async fn open(&self, path: &Path) -> Option<FileObject> {
        open_entry(path, self.inspector.as_ref()).await
    }

    /// Sleep out the poll interval. Returns false once cancelled.
    pub(crate) async fn idle(&self) -> bool {
        sleep_or_cancel(&self.cancel, self.config.interval).await
    }
}

/// A queued export stage with one worker task.
pub struct QueuedExportService<E: Exporter> {
    id: String,
    name: String,
    kind: String,
    queue: Arc<QueueManager>,
    quarantine: Option<Arc<Quarantine>>,
    exporter: Arc<E>,
    inspector: Arc<dyn ObjectInspector>,
    acceptance: Acceptance,
    config: ExportConfig,
    stats: Arc<StageStats>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Exporter> QueuedExportService<E> {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        queue: Arc<QueueManager>,
        exporter: E,
        config: ExportConfig,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: "QueuedExportService".to_string(),
            queue,
            quarantine: None,
            exporter: Arc::new(exporter),
            inspector: Arc::new(BasicInspector),
            acceptance: Acceptance::default(),
            config,
            stats: StageStats::new(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
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

    pub fn exporter(&self) -> &Arc<E> {
        &self.exporter
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<StageStats> {
        &self.stats
    }
}

struct ExportWorker<E: Exporter> {
    ctx: WorkerContext,
    exporter: Arc<E>,
}

impl<E: Exporter> ExportWorker<E> {
    async fn run(self) {
        let ctx = &self.ctx;
        debug!(stage = %ctx.stage, "Export worker started");
        let mut consecutive_retries = 0u32;

        while !ctx.cancel.is_cancelled() {
            if ctx.queue.size() > 0 {
                if self.exporter.connect().await.is_ok() {
                    self.drain(&mut consecutive_retries).await;
                }
                self.exporter.disconnect().await;
            }

            if ctx.queue.size() < RECOUNT_THRESHOLD {
                if let Err(e) = ctx.queue.recount().await {
                    warn!(stage = %ctx.stage, error = %e, "Queue recount failed");
                }
            }

            if !ctx.idle().await {
                break;
            }
        }

        ctx.stats.set_state(StageState::Stopped);
        debug!(stage = %ctx.stage, "Export worker stopped");
    }

    async fn drain(&self, consecutive_retries: &mut u32) {
        let ctx = &self.ctx;
        while !ctx.cancel.is_cancelled() {
            let Some(path) = ctx.queue.next_file().await else {
                break;
            };
            let started = Instant::now();
            let status = match ctx.open(&path).await {
                Some(object) => guarded(&ctx.stage, self.exporter.export(&object)).await,
                None => Status::Fail,
            };
            if ctx.apply(status, &path, started, consecutive_retries).await {
                break;
            }
        }
    }
}

#[async_trait]
impl<E: Exporter> PipelineStage for QueuedExportService<E> {
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
        if !self.config.enabled {
            info!("{} export is disabled", self.name);
            return Ok(());
        }

        let worker = ExportWorker {
            ctx: WorkerContext {
                stage: self.name.clone(),
                queue: self.queue.clone(),
                quarantine: self.quarantine.clone(),
                inspector: self.inspector.clone(),
                config: self.config.clone(),
                stats: self.stats.clone(),
                cancel: self.cancel.clone(),
            },
            exporter: self.exporter.clone(),
        };
        *self.task.lock() = Some(tokio::spawn(worker.run()));
        info!(
            "Started {} (interval {:?}, throttle {:?})",
            self.name, self.config.interval, self.config.throttle
        );
        Ok(())
    }

    async fn shutdown(&self) {
        if self.stats.state() == StageState::Running {
            self.stats.set_state(StageState::Stopping);
        }
        self.cancel.cancel();
        if self.task.lock().is_none() {
            self.stats.set_state(StageState::Stopped);
        }
    }

    fn is_down(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    fn status(&self) -> StageStatus {
        self.stats
            .snapshot(&self.id, &self.name, &self.kind)
            .with_queue_size(self.queue.size())
            .with_quarantine(self.quarantine.as_deref())
            .with_detail("enabled", self.config.enabled)
    }
}

#[async_trait]
impl<E: Exporter> ExportService for QueuedExportService<E> {
    async fn enqueue(&self, object: &FileObject) -> Result<()> {
        if !self.config.enabled || !self.accepts(object) {
            return Ok(());
        }
        self.queue.enqueue_object(object).await?;
        self.stats.record_in(object.file_name());
        Ok(())
    }
}
