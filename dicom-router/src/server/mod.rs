//! Embedded HTTP servers.
//!
//! Every server shares the same accept loop ([`HttpServer`]); what differs is
//! the router it serves:
//!
//! - the admin server (status, health, logging),
//! - storage browsing for a file storage stage with a `port`,
//! - the verifier for a database export stage with a `port`.

pub mod auth;
pub mod error;
pub mod http;
pub mod routes;
pub mod tls;

pub use auth::{AuthUser, BasicAuth};
pub use error::{ApiError, ApiResult};
pub use http::{HttpServer, HttpServerConfig};
pub use tls::TlsFiles;
