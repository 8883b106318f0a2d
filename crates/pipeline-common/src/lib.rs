//! # Pipeline Common
//!
//! This crate provides the execution engine shared by every routing pipeline:
//! durable file queues, quarantines, the stage abstractions and the export
//! workers that drain queues towards external systems.
//!
//! ## Features
//!
//! - `QueueManager`: crash-recoverable FIFO of files backing one stage
//! - `Quarantine`: append-only holding area for rejected objects
//! - `PipelineStage` and the role traits (`ImportService`, `Processor`,
//!   `StorageService`, `ExportService`)
//! - `QueuedExportService`: single-worker export loop with throttle and back-off
//! - `PooledExportService`: multi-worker export with one adapter per worker
//! - `Pipeline`: ordered stages plus the task moving objects between them
//!

use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod export;
pub mod object;
pub mod pipeline;
pub mod pool;
pub mod quarantine;
pub mod queue;
pub mod stage;
pub mod status;

#[cfg(test)]
mod test_utils;

pub use export::{
    ExportConfig, Exporter, QueuedExportService, RetryPolicy, dispose, open_entry, sleep_or_cancel,
};
pub use object::{BasicInspector, FileObject, ObjectInspector, ObjectKind, ObjectMetadata};
pub use pipeline::Pipeline;
pub use pool::{AdapterError, AdapterFactory, ExportAdapter, PoolConfig, PooledExportService};
pub use quarantine::Quarantine;
pub use queue::QueueManager;
pub use stage::{
    Acceptance, ExportService, ImportService, PipelineStage, Processor, StageHandle, StageState,
    StageStats, StageStatus, StorageService, Stored,
};
pub use status::Status;

pub use tokio_util::sync::CancellationToken;

/// Common error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Object error: {0}")]
    Object(String),
}

impl PipelineError {
    /// Attach an operation label and a path to an IO error.
    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, PipelineError>;
