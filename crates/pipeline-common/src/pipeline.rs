//! # Pipeline
//!
//! A pipeline is an ordered list of stages. The first stage is an
//! [`ImportService`]; a flow task takes each object it produces and hands it
//! through the remaining stages in order:
//!
//! - processors and storage stages transform the object, or consume it and end
//!   its flow;
//! - export stages persist a copy into their own queue.
//!
//! When the object has passed every stage the import copy is released. If a
//! storage stage asks for a retry, or an export stage cannot queue it, the
//! import copy is returned to its queue and the flow task backs off for one
//! poll interval.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::export::sleep_or_cancel;
use crate::object::FileObject;
use crate::stage::{ImportService, StageHandle, StageStatus, Stored};
use crate::{PipelineError, Result};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// An ordered set of stages plus the task that moves objects between them.
pub struct Pipeline {
    name: String,
    stages: Vec<StageHandle>,
    poll_interval: Duration,
    cancel: CancellationToken,
    flow: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: CancellationToken::new(),
            flow: Mutex::new(None),
        }
    }

    /// Add a stage to the end of the pipeline.
    pub fn add_stage(mut self, stage: StageHandle) -> Self {
        self.stages.push(stage);
        self
    }

    /// How long the flow task waits when the import stage has nothing ready.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[StageHandle] {
        &self.stages
    }

    /// Start every stage, then the flow task.
    ///
    /// A stage that fails to start is logged and left non-functional; the rest
    /// of the pipeline still runs. Only a pipeline without an import stage at
    /// its head is an error.
    pub async fn start(&self) -> Result<()> {
        let import = match self.stages.first() {
            Some(StageHandle::Import(import)) => import.clone(),
            _ => {
                return Err(PipelineError::Config(format!(
                    "pipeline '{}' must begin with an import service",
                    self.name
                )));
            }
        };

        for stage in &self.stages {
            if let Err(e) = stage.start().await {
                error!(
                    "Pipeline '{}': stage '{}' failed to start: {}",
                    self.name,
                    stage.name(),
                    e
                );
            }
        }

        let mut flow = self.flow.lock();
        if flow.is_some() {
            return Ok(());
        }
        let task = FlowTask {
            pipeline: self.name.clone(),
            import,
            stages: self.stages[1..].to_vec(),
            poll_interval: self.poll_interval,
            cancel: self.cancel.clone(),
        };
        *flow = Some(tokio::spawn(task.run()));
        info!("Pipeline '{}' started with {} stages", self.name, self.stages.len());
        Ok(())
    }

    /// Stop the flow task and ask every stage to stop. Does not wait.
    pub async fn shutdown(&self) {
        info!("Stopping pipeline '{}'", self.name);
        self.cancel.cancel();
        for stage in &self.stages {
            stage.shutdown().await;
        }
    }

    /// True once the flow task and every stage's workers have finished.
    pub fn is_down(&self) -> bool {
        let flow_down = self
            .flow
            .lock()
            .as_ref()
            .is_none_or(|handle| handle.is_finished());
        flow_down && self.stages.iter().all(StageHandle::is_down)
    }

    /// Poll [`is_down`](Self::is_down) until it holds or `timeout` passes.
    pub async fn wait_down(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_down() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    pub fn status(&self) -> Vec<StageStatus> {
        self.stages.iter().map(StageHandle::status).collect()
    }
}

struct FlowTask {
    pipeline: String,
    import: Arc<dyn ImportService>,
    stages: Vec<StageHandle>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl FlowTask {
    async fn run(self) {
        debug!("Pipeline '{}' flow task started", self.pipeline);
        while !self.cancel.is_cancelled() {
            match self.import.next_object().await {
                Some(object) => {
                    if !self.route(object).await
                        && !sleep_or_cancel(&self.cancel, self.poll_interval).await
                    {
                        break;
                    }
                }
                None => {
                    if !sleep_or_cancel(&self.cancel, self.poll_interval).await {
                        break;
                    }
                }
            }
        }
        debug!("Pipeline '{}' flow task stopped", self.pipeline);
    }

    /// Returns false when the import entry was returned for another attempt.
    async fn route(&self, object: FileObject) -> bool {
        let source = object.path().to_path_buf();
        let mut current = object;
        let mut delivered = true;

        for stage in &self.stages {
            if !stage.accepts(&current) {
                continue;
            }
            match stage {
                StageHandle::Processor(processor) => match processor.process(current).await {
                    Some(next) => current = next,
                    None => break,
                },
                StageHandle::Storage(storage) => match storage.store(current).await {
                    Stored::Object(next) => current = next,
                    Stored::Rejected => break,
                    Stored::Retry => {
                        debug!(
                            "Pipeline '{}': '{}' asked to retry {}",
                            self.pipeline,
                            storage.name(),
                            source.display()
                        );
                        delivered = false;
                        break;
                    }
                },
                StageHandle::Export(export) => {
                    if let Err(e) = export.enqueue(&current).await {
                        error!(
                            "Pipeline '{}': unable to queue {} for '{}': {}",
                            self.pipeline,
                            current.file_name(),
                            export.name(),
                            e
                        );
                        delivered = false;
                    }
                }
                StageHandle::Import(import) => {
                    warn!(
                        "Pipeline '{}': ignoring import stage '{}' past the head",
                        self.pipeline,
                        import.name()
                    );
                }
            }
        }

        if delivered {
            self.import.release(&source).await;
        } else {
            warn!(
                "Pipeline '{}': keeping {} queued for another attempt",
                self.pipeline,
                source.display()
            );
            self.import.return_object(&source).await;
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportConfig, Exporter, QueuedExportService};
    use crate::object::BasicInspector;
    use crate::queue::QueueManager;
    use crate::stage::{PipelineStage, Processor, StageState, StageStats};
    use crate::status::Status;
    use crate::test_utils::{init_tracing, wait_until};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Import stage serving whatever sits in its queue.
    struct QueueImport {
        queue: Arc<QueueManager>,
        stats: Arc<StageStats>,
    }

    #[async_trait]
    impl PipelineStage for QueueImport {
        fn id(&self) -> &str {
            "import"
        }
        fn name(&self) -> &str {
            "Import"
        }
        async fn start(&self) -> Result<()> {
            self.stats.try_start();
            Ok(())
        }
        async fn shutdown(&self) {
            self.stats.set_state(StageState::Stopped);
        }
        fn is_down(&self) -> bool {
            true
        }
        fn status(&self) -> StageStatus {
            self.stats
                .snapshot("import", "Import", "test")
                .with_queue_size(self.queue.size())
        }
    }

    #[async_trait]
    impl ImportService for QueueImport {
        async fn next_object(&self) -> Option<FileObject> {
            let path = self.queue.next_file().await?;
            FileObject::open(&path, &BasicInspector).await.ok()
        }
        async fn release(&self, path: &Path) {
            let _ = self.queue.release(path).await;
        }
        async fn return_object(&self, path: &Path) {
            self.queue.return_to_pending(path);
        }
    }

    /// Drops objects whose name starts with "drop".
    struct DropFilter {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl PipelineStage for DropFilter {
        fn id(&self) -> &str {
            "filter"
        }
        fn name(&self) -> &str {
            "Filter"
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) {}
        fn is_down(&self) -> bool {
            true
        }
        fn status(&self) -> StageStatus {
            StageStats::default().snapshot("filter", "Filter", "test")
        }
    }

    #[async_trait]
    impl Processor for DropFilter {
        async fn process(&self, object: FileObject) -> Option<FileObject> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            (!object.file_name().starts_with("drop")).then_some(object)
        }
    }

    struct CountingExporter(Arc<AtomicUsize>);

    #[async_trait]
    impl Exporter for CountingExporter {
        async fn export(&self, _object: &FileObject) -> Status {
            self.0.fetch_add(1, Ordering::SeqCst);
            Status::Ok
        }
    }

    #[tokio::test]
    async fn test_objects_flow_from_import_to_export() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let import_queue = Arc::new(QueueManager::open(dir.path().join("import")).await.unwrap());
        let export_queue = Arc::new(QueueManager::open(dir.path().join("export")).await.unwrap());

        for name in ["keep-1.txt", "drop-1.txt", "keep-2.txt"] {
            let path = dir.path().join(name);
            tokio::fs::write(&path, name).await.unwrap();
            import_queue.enqueue(&path).await.unwrap();
        }

        let exported = Arc::new(AtomicUsize::new(0));
        let filter = Arc::new(DropFilter {
            seen: AtomicUsize::new(0),
        });
        let export = Arc::new(QueuedExportService::new(
            "export",
            "Export",
            export_queue.clone(),
            CountingExporter(exported.clone()),
            ExportConfig::default().with_interval(Duration::from_millis(20)),
        ));

        let pipeline = Pipeline::new("main")
            .with_poll_interval(Duration::from_millis(20))
            .add_stage(StageHandle::Import(Arc::new(QueueImport {
                queue: import_queue.clone(),
                stats: StageStats::new(),
            })))
            .add_stage(StageHandle::Processor(filter.clone()))
            .add_stage(StageHandle::Export(export.clone()));
        pipeline.start().await.unwrap();

        assert!(wait_until(Duration::from_secs(5), || exported.load(Ordering::SeqCst) == 2).await);
        assert_eq!(filter.seen.load(Ordering::SeqCst), 3);
        assert_eq!(import_queue.recount().await.unwrap(), 0);
        assert_eq!(pipeline.status().len(), 3);

        pipeline.shutdown().await;
        assert!(pipeline.wait_down(Duration::from_secs(5)).await);
    }

    /// Storage or export stage that turns away the first `failures` objects.
    struct Flaky {
        failures: AtomicUsize,
        accepted: AtomicUsize,
    }

    impl Flaky {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                accepted: AtomicUsize::new(0),
            })
        }

        fn turn_away(&self) -> bool {
            self.failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl PipelineStage for Flaky {
        fn id(&self) -> &str {
            "flaky"
        }
        fn name(&self) -> &str {
            "Flaky"
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) {}
        fn is_down(&self) -> bool {
            true
        }
        fn status(&self) -> StageStatus {
            StageStats::default().snapshot("flaky", "Flaky", "test")
        }
    }

    #[async_trait]
    impl crate::stage::StorageService for Flaky {
        async fn store(&self, object: FileObject) -> Stored {
            if self.turn_away() {
                return Stored::Retry;
            }
            self.accepted.fetch_add(1, Ordering::SeqCst);
            Stored::Object(object)
        }
    }

    #[async_trait]
    impl crate::stage::ExportService for Flaky {
        async fn enqueue(&self, _object: &FileObject) -> Result<()> {
            if self.turn_away() {
                return Err(PipelineError::Queue("export queue unavailable".into()));
            }
            self.accepted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn import_with(dir: &TempDir, names: &[&str]) -> Arc<QueueManager> {
        let queue = Arc::new(QueueManager::open(dir.path().join("import")).await.unwrap());
        for name in names {
            let path = dir.path().join(name);
            tokio::fs::write(&path, name).await.unwrap();
            queue.enqueue(&path).await.unwrap();
        }
        queue
    }

    fn pipeline_over(queue: &Arc<QueueManager>, stage: StageHandle) -> Pipeline {
        Pipeline::new("flaky")
            .with_poll_interval(Duration::from_millis(20))
            .add_stage(StageHandle::Import(Arc::new(QueueImport {
                queue: queue.clone(),
                stats: StageStats::new(),
            })))
            .add_stage(stage)
    }

    #[tokio::test]
    async fn test_unqueued_object_is_returned_and_delivered_later() {
        let dir = TempDir::new().unwrap();
        let queue = import_with(&dir, &["a.txt"]).await;
        let export = Flaky::new(2);
        let pipeline = pipeline_over(&queue, StageHandle::Export(export.clone()));
        pipeline.start().await.unwrap();

        assert!(wait_until(Duration::from_secs(5), || export.accepted.load(Ordering::SeqCst) == 1).await);
        assert!(wait_until(Duration::from_secs(5), || queue.size() == 0 && queue.checked_out() == 0).await);
        assert_eq!(queue.recount().await.unwrap(), 0);

        pipeline.shutdown().await;
        assert!(pipeline.wait_down(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_storage_retry_keeps_the_import_entry() {
        let dir = TempDir::new().unwrap();
        let queue = import_with(&dir, &["a.txt"]).await;
        let storage = Flaky::new(usize::MAX);
        let pipeline = pipeline_over(&queue, StageHandle::Storage(storage.clone()));
        pipeline.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(storage.accepted.load(Ordering::SeqCst), 0);
        pipeline.shutdown().await;
        assert!(pipeline.wait_down(Duration::from_secs(5)).await);

        // nothing stays checked out; the entry is still on disk and pending
        assert_eq!(queue.checked_out(), 0);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.recount().await.unwrap(), 1);

        storage.failures.store(0, Ordering::SeqCst);
        let pipeline = pipeline_over(&queue, StageHandle::Storage(storage.clone()));
        pipeline.start().await.unwrap();
        assert!(wait_until(Duration::from_secs(5), || storage.accepted.load(Ordering::SeqCst) == 1).await);
        assert!(wait_until(Duration::from_secs(5), || queue.size() == 0 && queue.checked_out() == 0).await);

        pipeline.shutdown().await;
        assert!(pipeline.wait_down(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_pipeline_requires_import_head() {
        let filter = Arc::new(DropFilter {
            seen: AtomicUsize::new(0),
        });
        let pipeline = Pipeline::new("broken").add_stage(StageHandle::Processor(filter));
        assert!(matches!(
            pipeline.start().await,
            Err(PipelineError::Config(_))
        ));
        assert!(pipeline.is_down());
    }
}
