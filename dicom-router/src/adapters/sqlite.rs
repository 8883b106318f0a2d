//! SQLite adapter: records exported objects in an `exported_objects` table.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_common::{FileObject, Status};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use tracing::{debug, warn};

use super::{DatabaseAdapter, UidRecord, file_digest};
use crate::Result;
use crate::config::StageConfig;
use crate::storage::StoredObject;

pub const CLASS: &str = "sqlite";

/// Database file used when the stage names none.
const DEFAULT_DATABASE_FILE: &str = "exports.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS exported_objects (
    uid TEXT PRIMARY KEY NOT NULL,
    study_uid TEXT,
    file_path TEXT NOT NULL,
    url TEXT,
    digest TEXT NOT NULL,
    recorded_at TEXT NOT NULL
)";

const UPSERT: &str = "INSERT INTO exported_objects (uid, study_uid, file_path, url, digest, recorded_at)
    VALUES (?, ?, ?, ?, ?, ?)
    ON CONFLICT(uid) DO UPDATE SET
        study_uid = excluded.study_uid,
        file_path = excluded.file_path,
        url = excluded.url,
        digest = excluded.digest,
        recorded_at = excluded.recorded_at";

/// One connection per export worker.
pub struct SqliteAdapter {
    options: SqliteConnectOptions,
    conn: Option<SqliteConnection>,
}

impl SqliteAdapter {
    pub fn new(options: SqliteConnectOptions) -> Self {
        Self {
            options: options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(BUSY_TIMEOUT)
                .create_if_missing(true),
            conn: None,
        }
    }

    /// `database` may be a `sqlite:` URL or a file path; without it the
    /// database lives in the stage's root directory.
    pub fn from_config(config: &StageConfig) -> Result<Self> {
        let options = match config.attr("database") {
            Some(url) if url.starts_with("sqlite:") => SqliteConnectOptions::from_str(url)?,
            Some(path) => SqliteConnectOptions::new().filename(path),
            None => {
                let path: PathBuf = config.root()?.join(DEFAULT_DATABASE_FILE);
                SqliteConnectOptions::new().filename(path)
            }
        };
        Ok(Self::new(options))
    }

    async fn open(&self) -> Result<SqliteConnection> {
        let mut conn = self.options.connect().await?;
        sqlx::query(CREATE_TABLE).execute(&mut conn).await?;
        Ok(conn)
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    async fn connect(&mut self) -> Status {
        if self.conn.is_some() {
            return Status::Ok;
        }
        match self.open().await {
            Ok(conn) => {
                self.conn = Some(conn);
                Status::Ok
            }
            Err(e) => {
                warn!(error = %e, "Unable to open the export database");
                Status::Retry
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take()
            && let Err(e) = conn.close().await
        {
            debug!(error = %e, "Error closing the export database");
        }
    }

    async fn process(&mut self, object: &FileObject, stored: Option<&StoredObject>) -> Result<Status> {
        let Some(uid) = object.uid() else {
            warn!(object = %object.file_name(), "No uid; cannot record");
            return Ok(Status::Fail);
        };
        let Some(conn) = self.conn.as_mut() else {
            return Ok(Status::Retry);
        };

        let file = stored.map(|s| s.file.as_path()).unwrap_or(object.path());
        let digest = file_digest(file).await?;
        sqlx::query(UPSERT)
            .bind(uid)
            .bind(object.study_uid())
            .bind(file.to_string_lossy().into_owned())
            .bind(stored.map(|s| s.url.as_str()))
            .bind(&digest)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await?;
        Ok(Status::Ok)
    }

    async fn uid_query(&mut self, uids: &BTreeSet<String>) -> Result<BTreeMap<String, UidRecord>> {
        if self.conn.is_none() {
            self.conn = Some(self.open().await?);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Ok(BTreeMap::new());
        };

        let mut found = BTreeMap::new();
        for uid in uids {
            let row: Option<(DateTime<Utc>, String)> =
                sqlx::query_as("SELECT recorded_at, digest FROM exported_objects WHERE uid = ?")
                    .bind(uid)
                    .fetch_optional(&mut *conn)
                    .await?;
            if let Some((date, digest)) = row {
                found.insert(uid.clone(), UidRecord { date, digest });
            }
        }
        Ok(found)
    }

    async fn shutdown(&mut self) {
        self.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageRole;
    use pipeline_common::{ObjectKind, ObjectMetadata};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StageConfig {
        StageConfig::new(StageRole::Export, "db").with_attr("root", dir.path().to_string_lossy())
    }

    #[tokio::test]
    async fn test_record_and_query() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obj");
        tokio::fs::write(&path, b"abc").await.unwrap();
        let object = FileObject::new(
            &path,
            ObjectKind::Dicom,
            ObjectMetadata::default().with_uid("1.2.3").with_study_uid("9"),
        );

        let mut writer = SqliteAdapter::from_config(&config(&dir)).unwrap();
        assert_eq!(writer.process(&object, None).await.unwrap(), Status::Retry);
        assert_eq!(writer.connect().await, Status::Ok);
        assert_eq!(writer.process(&object, None).await.unwrap(), Status::Ok);
        // re-recording the same uid updates in place
        assert_eq!(writer.process(&object, None).await.unwrap(), Status::Ok);
        writer.shutdown().await;
        assert!(dir.path().join(DEFAULT_DATABASE_FILE).exists());

        let mut reader = SqliteAdapter::from_config(&config(&dir)).unwrap();
        let uids: BTreeSet<String> = ["1.2.3", "4.5.6"].into_iter().map(String::from).collect();
        let found = reader.uid_query(&uids).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            found["1.2.3"].digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_object_without_uid_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obj");
        tokio::fs::write(&path, b"x").await.unwrap();
        let mut adapter = SqliteAdapter::from_config(&config(&dir)).unwrap();
        adapter.connect().await;
        let object = FileObject::new(&path, ObjectKind::File, ObjectMetadata::default());
        assert_eq!(adapter.process(&object, None).await.unwrap(), Status::Fail);
    }
}
