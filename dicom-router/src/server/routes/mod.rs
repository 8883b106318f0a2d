//! Route modules.
//!
//! The admin server combines `health`, `status` and `logging`; `storage` and
//! `verifier` are served by the stages that own them.

pub mod health;
pub mod logging;
pub mod status;
pub mod storage;
pub mod verifier;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;

use crate::context::AppContext;
use crate::server::auth::AuthUser;
use crate::server::error::{ApiError, ApiResult};

/// State shared by the admin routes.
#[derive(Clone)]
pub struct AdminState {
    pub context: Arc<AppContext>,
}

impl AdminState {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    /// Resolve the caller when the server requires authentication.
    ///
    /// Returns `None` when authentication is off. `role` additionally
    /// restricts the route to users holding it.
    pub fn authorize(&self, headers: &HeaderMap, role: Option<&str>) -> ApiResult<Option<AuthUser>> {
        if !self.context.config().server.require_authentication {
            return Ok(None);
        }
        let user = self
            .context
            .auth()
            .authenticate(headers)
            .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
        if let Some(role) = role
            && !user.has_role(role)
        {
            return Err(ApiError::forbidden(format!("Role '{role}' required")));
        }
        Ok(Some(user))
    }
}

/// Create the admin router.
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest("/status", status::router())
        .nest("/logging", logging::router())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request, StatusCode, header};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::config::AppConfig;

    async fn app(dir: &TempDir, require_authentication: bool) -> Router {
        let root = dir.path().display();
        let xml = format!(
            r#"<Configuration>
  <Server port="0" requireAuthentication="{}"/>
  <Users>
    <User username="admin" password="pw" roles="admin"/>
    <User username="viewer" password="pw"/>
  </Users>
  <Pipeline name="Main">
    <ImportService class="DirectoryImportService" id="in" root="{root}/in"/>
    <StorageService class="FileStorageService" id="store" root="{root}/store"/>
  </Pipeline>
</Configuration>"#,
            if require_authentication { "yes" } else { "no" }
        );
        let config = AppConfig::from_xml(&xml).unwrap();
        let context = AppContext::build(config, Some("localhost")).await;
        admin_router(AdminState::new(Arc::new(context)))
    }

    fn request(method: Method, uri: &str, user: Option<&str>, body: Body) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(user) = user {
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Basic {}", STANDARD.encode(format!("{user}:pw"))),
            );
        }
        builder.body(body).unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_credentials() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir, true).await;

        let response = app
            .oneshot(request(Method::GET, "/health/", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["status"], "healthy");
        // Built but not started.
        assert_eq!(body["pipelines"], 0);
    }

    #[tokio::test]
    async fn test_status_lists_pipelines_and_stages() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir, false).await;

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/status/", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["host"], "localhost");
        assert_eq!(body["pipelines"][0]["name"], "Main");
        assert_eq!(body["pipelines"][0]["stages"].as_array().unwrap().len(), 2);

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/status/stages/store", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["id"], "store");

        let response = app
            .oneshot(request(Method::GET, "/status/stages/missing", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_requires_authentication_when_enabled() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir, true).await;

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/status/", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(request(Method::GET, "/status/", Some("viewer"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_logging_update_requires_admin() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir, true).await;
        let update = || Body::from(r#"{"filter":"dicom_router=debug"}"#);

        let response = app
            .clone()
            .oneshot(request(Method::PUT, "/logging/level", Some("viewer"), update()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // No reloadable subscriber in tests.
        let response = app
            .oneshot(request(Method::PUT, "/logging/level", Some("admin"), update()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
