//! Stage abstractions.
//!
//! Every stage implements [`PipelineStage`] (identity, lifecycle and status)
//! plus exactly one role trait. A [`Pipeline`](crate::Pipeline) holds stages as
//! [`StageHandle`]s.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::object::{FileObject, ObjectKind};
use crate::quarantine::Quarantine;

/// Lifecycle of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Constructed,
    Running,
    Stopping,
    Stopped,
}

impl StageState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StageState::Constructed,
            1 => StageState::Running,
            2 => StageState::Stopping,
            _ => StageState::Stopped,
        }
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageState::Constructed => write!(f, "constructed"),
            StageState::Running => write!(f, "running"),
            StageState::Stopping => write!(f, "stopping"),
            StageState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Which object kinds a stage is willing to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acceptance {
    pub dicom: bool,
    pub xml: bool,
    pub zip: bool,
    pub file: bool,
}

impl Default for Acceptance {
    fn default() -> Self {
        Self {
            dicom: true,
            xml: true,
            zip: true,
            file: true,
        }
    }
}

impl Acceptance {
    pub fn accepts(&self, kind: ObjectKind) -> bool {
        match kind {
            ObjectKind::Dicom => self.dicom,
            ObjectKind::Xml => self.xml,
            ObjectKind::Zip => self.zip,
            ObjectKind::File => self.file,
        }
    }
}

/// Live counters of a stage.
///
/// Updated by the worker tasks and read by the status surface. Everything is
/// atomic except the last object name, which sits behind a short-held lock.
#[derive(Debug)]
pub struct StageStats {
    state: AtomicU8,
    objects_in: AtomicU64,
    objects_out: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    /// Milliseconds since the epoch, 0 when unset.
    last_in_ms: AtomicI64,
    last_out_ms: AtomicI64,
    /// `u64::MAX` when unset.
    last_elapsed_ms: AtomicU64,
    last_object: RwLock<Option<String>>,
}

impl Default for StageStats {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(StageState::Constructed as u8),
            objects_in: AtomicU64::new(0),
            objects_out: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_in_ms: AtomicI64::new(0),
            last_out_ms: AtomicI64::new(0),
            last_elapsed_ms: AtomicU64::new(u64::MAX),
            last_object: RwLock::new(None),
        }
    }
}

impl StageStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: StageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move from `Constructed` to `Running`. Returns false if the stage was
    /// already started, so `start()` can be called more than once safely.
    pub fn try_start(&self) -> bool {
        self.state
            .compare_exchange(
                StageState::Constructed as u8,
                StageState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// An object entered the stage.
    pub fn record_in(&self, name: &str) {
        self.objects_in.fetch_add(1, Ordering::Relaxed);
        self.last_in_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        *self.last_object.write() = Some(name.to_string());
    }

    /// An object left the stage successfully after `elapsed`.
    pub fn record_out(&self, elapsed: std::time::Duration) {
        self.objects_out.fetch_add(1, Ordering::Relaxed);
        self.last_out_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.last_elapsed_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn objects_in(&self) -> u64 {
        self.objects_in.load(Ordering::Relaxed)
    }

    pub fn objects_out(&self) -> u64 {
        self.objects_out.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot for the status surface.
    pub fn snapshot(&self, id: &str, name: &str, kind: &str) -> StageStatus {
        let elapsed = self.last_elapsed_ms.load(Ordering::Relaxed);
        StageStatus {
            id: id.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            state: self.state(),
            queue_size: None,
            quarantine_size: None,
            objects_in: self.objects_in(),
            objects_out: self.objects_out(),
            retries: self.retries(),
            failures: self.failures(),
            last_object_in: millis_to_time(self.last_in_ms.load(Ordering::Relaxed)),
            last_object_out: millis_to_time(self.last_out_ms.load(Ordering::Relaxed)),
            last_elapsed_ms: (elapsed != u64::MAX).then_some(elapsed),
            last_object: self.last_object.read().clone(),
            details: BTreeMap::new(),
        }
    }
}

fn millis_to_time(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

/// Read-only operational snapshot of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStatus {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub state: StageState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_size: Option<usize>,
    pub objects_in: u64,
    pub objects_out: u64,
    pub retries: u64,
    pub failures: u64,
    pub last_object_in: Option<DateTime<Utc>>,
    pub last_object_out: Option<DateTime<Utc>>,
    pub last_elapsed_ms: Option<u64>,
    pub last_object: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl StageStatus {
    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = Some(size);
        self
    }

    pub fn with_quarantine(mut self, quarantine: Option<&Quarantine>) -> Self {
        self.quarantine_size = quarantine.map(Quarantine::count);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

/// Identity, lifecycle and status shared by every stage.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Unique id used by sibling stages to reference this one.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Object kinds this stage handles.
    fn acceptance(&self) -> Acceptance {
        Acceptance::default()
    }

    fn accepts(&self, object: &FileObject) -> bool {
        self.acceptance().accepts(object.kind())
    }

    fn quarantine(&self) -> Option<&Quarantine> {
        None
    }

    /// Spawn the stage's workers. Called once every stage of the process is
    /// constructed; calling it again is a no-op.
    async fn start(&self) -> Result<()>;

    /// Ask the workers to stop. Returns without waiting for them.
    async fn shutdown(&self);

    /// True once every worker task of the stage has finished.
    fn is_down(&self) -> bool;

    fn status(&self) -> StageStatus;
}

/// Source of objects entering a pipeline.
#[async_trait]
pub trait ImportService: PipelineStage {
    /// Oldest object ready for the pipeline, without blocking.
    async fn next_object(&self) -> Option<FileObject>;

    /// The pipeline is done with `path`. Deletes it only if it still lives in
    /// the import queue.
    async fn release(&self, path: &Path);

    /// The pipeline could not finish with `path`; keep it queued so it is
    /// served again.
    async fn return_object(&self, path: &Path);
}

/// A transformation or filter step.
#[async_trait]
pub trait Processor: PipelineStage {
    /// Process `object`, returning the object to hand to the next stage or
    /// `None` when the stage consumed or rejected it.
    async fn process(&self, object: FileObject) -> Option<FileObject>;
}

/// Outcome of handing an object to a storage stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stored {
    /// Stored; hand this object on.
    Object(FileObject),
    /// The store is unavailable right now. The object should be offered again.
    Retry,
    /// The object was rejected and its flow ends here.
    Rejected,
}

impl Stored {
    pub fn object(self) -> Option<FileObject> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }
}

/// A stage that keeps a durable copy of objects.
#[async_trait]
pub trait StorageService: PipelineStage {
    async fn store(&self, object: FileObject) -> Stored;
}

/// A queued stage shipping objects out of the pipeline.
#[async_trait]
pub trait ExportService: PipelineStage {
    /// Persist `object` into the stage's queue.
    async fn enqueue(&self, object: &FileObject) -> Result<()>;
}

/// A stage of a pipeline, tagged by role.
#[derive(Clone)]
pub enum StageHandle {
    Import(Arc<dyn ImportService>),
    Processor(Arc<dyn Processor>),
    Storage(Arc<dyn StorageService>),
    Export(Arc<dyn ExportService>),
}

macro_rules! with_stage {
    ($handle:expr, $s:ident => $body:expr) => {
        match $handle {
            StageHandle::Import($s) => $body,
            StageHandle::Processor($s) => $body,
            StageHandle::Storage($s) => $body,
            StageHandle::Export($s) => $body,
        }
    };
}

impl StageHandle {
    pub fn id(&self) -> &str {
        with_stage!(self, s => s.id())
    }

    pub fn name(&self) -> &str {
        with_stage!(self, s => s.name())
    }

    pub fn role(&self) -> &'static str {
        match self {
            StageHandle::Import(_) => "import",
            StageHandle::Processor(_) => "processor",
            StageHandle::Storage(_) => "storage",
            StageHandle::Export(_) => "export",
        }
    }

    pub fn accepts(&self, object: &FileObject) -> bool {
        with_stage!(self, s => s.accepts(object))
    }

    pub async fn start(&self) -> Result<()> {
        with_stage!(self, s => s.start().await)
    }

    pub async fn shutdown(&self) {
        with_stage!(self, s => s.shutdown().await)
    }

    pub fn is_down(&self) -> bool {
        with_stage!(self, s => s.is_down())
    }

    pub fn status(&self) -> StageStatus {
        with_stage!(self, s => s.status())
    }
}

impl std::fmt::Debug for StageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHandle")
            .field("role", &self.role())
            .field("id", &self.id())
            .finish()
    }
}
