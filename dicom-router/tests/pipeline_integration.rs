//! Integration tests for complete pipelines.
//!
//! Every test builds an [`AppContext`] from an XML configuration rooted in a
//! temporary directory, starts it, drives objects through the real stages
//! and observes the results on disk and over HTTP.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dicom_router::AppContext;
use dicom_router::config::AppConfig;
use dicom_router::server::tls::install_crypto_provider;
use dicom_router::storage::FileSystemManager;
use pipeline_common::{FileObject, ObjectKind, ObjectMetadata};
use reqwest::StatusCode;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const WAIT: Duration = Duration::from_secs(20);

/// A port nothing listens on right now.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("Failed to find a free port")
}

async fn start(xml: &str) -> Arc<AppContext> {
    install_crypto_provider();
    let config = AppConfig::from_xml(xml).expect("Invalid test configuration");
    let context = Arc::new(AppContext::build(config, Some("127.0.0.1")).await);
    context.start().await.expect("Failed to start context");
    context
}

/// Poll `check` until it holds or `WAIT` expires.
async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Write through a dot-file so the importer never sees a partial object.
async fn drop_file(dir: &Path, name: &str, content: &str) {
    tokio::fs::create_dir_all(dir).await.unwrap();
    let temp = dir.join(format!(".{name}"));
    tokio::fs::write(&temp, content).await.unwrap();
    tokio::fs::rename(&temp, dir.join(name)).await.unwrap();
}

async fn file_count(dir: &Path) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(_)) = entries.next_entry().await {
        count += 1;
    }
    count
}

fn stored_path(root: &Path, study: &str, file: &str) -> PathBuf {
    root.join("store").join("__default").join(study).join(file)
}

mod end_to_end {
    use super::*;

    fn config(root: &Path, storage_port: u16, verifier_port: u16) -> String {
        let root = root.display();
        format!(
            r#"<Configuration>
  <Server port="0"/>
  <Users>
    <User username="importer" password="pw" roles="import"/>
    <User username="reader" password="pw" roles="read"/>
  </Users>
  <Pipeline name="Main">
    <ImportService class="DirectoryImportService" id="in" root="{root}/in" minAge="0" interval="1000"/>
    <StorageService class="FileStorageService" id="store" root="{root}/store"
                    port="{storage_port}" requireAuthentication="yes"/>
    <ExportService class="DatabaseExportService" id="db" root="{root}/db" adapterClass="sqlite"
                   fileStorageServiceID="store" port="{verifier_port}" requireAuthentication="yes"
                   interval="1000" poolSize="2"/>
  </Pipeline>
</Configuration>"#
        )
    }

    #[tokio::test]
    async fn test_imported_objects_are_stored_recorded_and_verified() {
        let dir = TempDir::new().unwrap();
        let storage_port = free_port();
        let verifier_port = free_port();
        let context = start(&config(dir.path(), storage_port, verifier_port)).await;

        let import_dir = dir.path().join("in").join("import");
        let first = r#"<report uid="1.2.3" studyUID="9.9"/>"#;
        drop_file(&import_dir, "a.xml", first).await;
        drop_file(&import_dir, "b.xml", r#"<report uid="1.2.4" studyUID="9.9"/>"#).await;

        let stored = stored_path(dir.path(), "9.9", "1.2.3.xml");
        wait_until("the first object to be stored", || {
            let stored = stored.clone();
            async move { stored.exists() }
        })
        .await;
        wait_until("the import directory to drain", || {
            let import_dir = import_dir.clone();
            async move { file_count(&import_dir).await == 0 }
        })
        .await;

        let client = reqwest::Client::new();
        let verify_url =
            format!("http://127.0.0.1:{verifier_port}/verify?uids=1.2.3;%201.2.4;9.9.9");

        let body = {
            let mut last = String::new();
            let deadline = tokio::time::Instant::now() + WAIT;
            loop {
                let response = client
                    .get(&verify_url)
                    .basic_auth("importer", Some("pw"))
                    .send()
                    .await
                    .expect("Verifier request failed");
                assert_eq!(response.status(), StatusCode::OK);
                last = response.text().await.unwrap_or(last);
                if last.contains("uid=\"1.2.3\"") && last.contains("uid=\"1.2.4\"") {
                    break last;
                }
                assert!(tokio::time::Instant::now() < deadline, "objects never recorded: {last}");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        };
        assert!(body.starts_with("<result>"));
        assert!(!body.contains("9.9.9"));
        assert_eq!(body.matches("<file ").count(), 2);

        let response = client.get(&verify_url).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.bytes().await.unwrap().is_empty());

        let response = client
            .get(format!("http://127.0.0.1:{verifier_port}/verify"))
            .basic_auth("importer", Some("pw"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let file_url = format!("http://127.0.0.1:{storage_port}/storage/__default/9.9/1.2.3.xml");
        let response = client.get(&file_url).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = client
            .get(&file_url)
            .basic_auth("reader", Some("pw"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), first);

        let db = context.stage("db").expect("db stage registered");
        assert_eq!(db.status().failures, 0);

        assert!(context.shutdown(Duration::from_secs(10)).await);
    }
}

mod pull_import {
    use super::*;

    /// Serves `payload` once, then reports an empty queue. Returns the ack byte.
    async fn peer(payload: &'static [u8]) -> (u16, tokio::sync::oneshot::Receiver<u8>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let mut ack_tx = Some(ack_tx);
            while let Ok((mut socket, _)) = listener.accept().await {
                match ack_tx.take() {
                    Some(tx) => {
                        let length = payload.len() as u32;
                        socket.write_all(&length.to_le_bytes()).await.unwrap();
                        socket.write_all(payload).await.unwrap();
                        let mut ack = [0u8; 1];
                        socket.read_exact(&mut ack).await.unwrap();
                        let _ = tx.send(ack[0]);
                    }
                    None => {
                        let _ = socket.write_all(&0u32.to_le_bytes()).await;
                    }
                }
            }
        });
        (port, ack_rx)
    }

    #[tokio::test]
    async fn test_pulled_object_reaches_storage() {
        let dir = TempDir::new().unwrap();
        let (peer_port, ack) = peer(br#"<report uid="5.6.7" studyUID="1.1"/>"#).await;
        let root = dir.path().display();
        let context = start(&format!(
            r#"<Configuration>
  <Server port="0"/>
  <Pipeline name="Pull">
    <ImportService class="PollingImportService" id="pull" root="{root}/pull"
                   url="tcp://127.0.0.1:{peer_port}" interval="1000"/>
    <StorageService class="FileStorageService" id="store" root="{root}/store"/>
  </Pipeline>
</Configuration>"#
        ))
        .await;

        let ack = tokio::time::timeout(WAIT, ack)
            .await
            .expect("peer was never polled")
            .expect("peer dropped");
        assert_eq!(ack, 1);

        let stored = stored_path(dir.path(), "1.1", "5.6.7.xml");
        wait_until("the pulled object to be stored", || {
            let stored = stored.clone();
            async move { stored.exists() }
        })
        .await;

        wait_until("the pull queue to drain", || {
            let context = context.clone();
            async move { context.stage("pull").and_then(|s| s.status().queue_size) == Some(0) }
        })
        .await;

        assert!(context.shutdown(Duration::from_secs(10)).await);
    }
}

mod storage {
    use super::*;

    #[tokio::test]
    async fn test_same_uid_is_stored_once() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().display();
        let context = start(&format!(
            r#"<Configuration>
  <Server port="0"/>
  <Pipeline name="Store">
    <ImportService class="DirectoryImportService" id="in" root="{root}/in" minAge="0" interval="1000"/>
    <StorageService class="FileStorageService" id="store" root="{root}/store"/>
  </Pipeline>
</Configuration>"#
        ))
        .await;

        let import_dir = dir.path().join("in").join("import");
        let stored = stored_path(dir.path(), "3.3", "2.2.xml");

        drop_file(&import_dir, "v1.xml", r#"<report uid="2.2" studyUID="3.3" v="1"/>"#).await;
        wait_until("the first version", || {
            let stored = stored.clone();
            async move { stored.exists() }
        })
        .await;

        let second = r#"<report uid="2.2" studyUID="3.3" v="2"/>"#;
        drop_file(&import_dir, "v2.xml", second).await;
        wait_until("the second version to replace the first", || {
            let stored = stored.clone();
            async move {
                tokio::fs::read_to_string(&stored)
                    .await
                    .is_ok_and(|text| text == second)
            }
        })
        .await;

        let study_dir = stored.parent().unwrap().to_path_buf();
        assert_eq!(file_count(&study_dir).await, 1);

        assert!(context.shutdown(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_index_survives_restart_and_retention_purges() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("store");
        let source = dir.path().join("in.dcm");
        tokio::fs::write(&source, b"payload").await.unwrap();
        let object = FileObject::new(
            source,
            ObjectKind::Dicom,
            ObjectMetadata::default().with_uid("4.4").with_study_uid("8.8"),
        );

        {
            let manager = FileSystemManager::open(&root, true).await.unwrap();
            manager.store("site", &object).await.unwrap();
        }

        let manager = FileSystemManager::open(&root, true).await.unwrap();
        let location = manager
            .locate("site", Some("8.8"), "4.4.dcm")
            .expect("stored object indexed after reopening");
        assert_eq!(location.url("http://router:9090/storage"), "http://router:9090/storage/site/8.8/4.4.dcm");

        let future = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(manager.purge_older_than(future).await, 1);
        assert!(manager.locate("site", Some("8.8"), "4.4.dcm").is_none());
        assert!(!location.file.exists());
    }
}
