//! dicom-router library crate.
//!
//! Routes DICOM, XML and ZIP objects through configurable pipelines of
//! import, processing, storage and export stages. The binary wires these
//! modules together; they are exposed here for integration testing.

pub mod adapters;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod server;
pub mod stages;
pub mod storage;
pub mod utils;

pub use context::AppContext;
pub use error::{Error, Result};
