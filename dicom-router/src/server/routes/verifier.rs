//! Delivery verifier: `GET /verify?uids=a;b;c`.
//!
//! Answers with the subset of the requested identifiers the export database
//! has recorded:
//!
//! ```xml
//! <result>
//!   <file uid="1.2.3" date="2024-05-01T10:00:00Z" digest="..."/>
//! </result>
//! ```
//!
//! Failures are bare status codes with empty bodies: 401 when the caller is
//! not allowed, 404 without identifiers or with a malformed query, 500 when
//! the database is unreachable. Authentication is checked before the query is
//! looked at.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{Query, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use quick_xml::escape::escape;
use serde::Deserialize;
use tracing::warn;

use crate::adapters::UidRecord;
use crate::server::auth::BasicAuth;

/// Role needed to query the verifier.
pub const IMPORT_ROLE: &str = "import";

/// Source of recorded identifiers.
#[async_trait]
pub trait UidLookup: Send + Sync {
    async fn lookup(&self, uids: &BTreeSet<String>) -> crate::Result<BTreeMap<String, UidRecord>>;
}

#[derive(Clone)]
pub struct VerifierState {
    pub lookup: Arc<dyn UidLookup>,
    pub auth: Arc<BasicAuth>,
    pub require_authentication: bool,
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub uids: Option<String>,
}

pub fn router(state: VerifierState) -> Router {
    Router::new()
        .route("/", get(verify))
        .route("/verify", get(verify))
        .with_state(state)
}

/// Split a `;`-separated list, ignoring whitespace and empty entries.
pub fn parse_uids(raw: &str) -> BTreeSet<String> {
    raw.split(';')
        .map(|uid| uid.chars().filter(|c| !c.is_whitespace()).collect::<String>())
        .filter(|uid| !uid.is_empty())
        .collect()
}

pub fn render(records: &BTreeMap<String, UidRecord>) -> String {
    let mut xml = String::from("<result>\n");
    for (uid, record) in records {
        xml.push_str(&format!(
            "  <file uid=\"{}\" date=\"{}\" digest=\"{}\"/>\n",
            escape(uid.as_str()),
            record.date.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            escape(record.digest.as_str())
        ));
    }
    xml.push_str("</result>");
    xml
}

async fn verify(
    State(state): State<VerifierState>,
    query: Result<Query<VerifyQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Response {
    if state.require_authentication {
        let allowed = state
            .auth
            .authenticate(&headers)
            .is_some_and(|user| user.has_role(IMPORT_ROLE));
        if !allowed {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let Ok(Query(query)) = query else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let uids = query.uids.as_deref().map(parse_uids).unwrap_or_default();
    if uids.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }

    match state.lookup.lookup(&uids).await {
        Ok(records) => {
            let mut response = render(&records).into_response();
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/xml; charset=utf-8"),
            );
            response
        }
        Err(e) => {
            warn!(error = %e, "Verifier query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use chrono::{TimeZone, Utc};
    use tower::ServiceExt;

    struct Fixed(BTreeMap<String, UidRecord>);

    #[async_trait]
    impl UidLookup for Fixed {
        async fn lookup(&self, uids: &BTreeSet<String>) -> crate::Result<BTreeMap<String, UidRecord>> {
            Ok(self
                .0
                .iter()
                .filter(|(uid, _)| uids.contains(*uid))
                .map(|(uid, record)| (uid.clone(), record.clone()))
                .collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl UidLookup for Broken {
        async fn lookup(&self, _: &BTreeSet<String>) -> crate::Result<BTreeMap<String, UidRecord>> {
            Err(crate::Error::Other("database offline".into()))
        }
    }

    fn state(lookup: Arc<dyn UidLookup>, require_authentication: bool) -> VerifierState {
        VerifierState {
            lookup,
            auth: Arc::new(BasicAuth::new(&[
                UserConfig {
                    username: "importer".into(),
                    password: "pw".into(),
                    roles: vec![IMPORT_ROLE.into()],
                },
                UserConfig {
                    username: "viewer".into(),
                    password: "pw".into(),
                    roles: vec!["read".into()],
                },
            ])),
            require_authentication,
        }
    }

    fn known() -> Arc<dyn UidLookup> {
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        Arc::new(Fixed(BTreeMap::from([
            ("1.1".to_string(), UidRecord { date, digest: "aa".into() }),
            ("2.2".to_string(), UidRecord { date, digest: "bb".into() }),
        ])))
    }

    fn request(uri: &str, user: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(user) = user {
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Basic {}", STANDARD.encode(format!("{user}:pw"))),
            );
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body(response: Response) -> String {
        String::from_utf8(to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_parse_uids() {
        let uids = parse_uids(" 1.1 ;;2. 2; ");
        assert_eq!(uids.into_iter().collect::<Vec<_>>(), vec!["1.1", "2.2"]);
        assert!(parse_uids(" ; ").is_empty());
    }

    #[tokio::test]
    async fn test_returns_only_known_uids() {
        let app = router(state(known(), false));
        let response = app
            .oneshot(request("/verify?uids=1.1;3.3;2.2;4.4", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body(response).await,
            "<result>\n  <file uid=\"1.1\" date=\"2024-05-01T10:00:00Z\" digest=\"aa\"/>\n  \
             <file uid=\"2.2\" date=\"2024-05-01T10:00:00Z\" digest=\"bb\"/>\n</result>"
        );
    }

    #[tokio::test]
    async fn test_missing_uids_is_not_found() {
        let app = router(state(known(), false));
        for uri in ["/", "/verify?uids=", "/verify?uids=;%20;"] {
            let response = app.clone().oneshot(request(uri, None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
            assert!(body(response).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_unauthorized_callers_get_empty_401() {
        let app = router(state(known(), true));
        for user in [None, Some("viewer"), Some("nobody")] {
            let response = app
                .clone()
                .oneshot(request("/verify?uids=1.1", user))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert!(body(response).await.is_empty());
        }
        let response = app
            .oneshot(request("/verify?uids=1.1", Some("importer")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_query_is_checked_after_authentication() {
        let app = router(state(known(), true));
        let uri = "/verify?uids=1.1&uids=2.2";

        let response = app.clone().oneshot(request(uri, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body(response).await.is_empty());

        let response = app.oneshot(request(uri, Some("importer"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failure_is_500() {
        let app = router(state(Arc::new(Broken), false));
        let response = app.oneshot(request("/?uids=1.1", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
