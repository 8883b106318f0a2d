//! Durable, crash-recoverable FIFO of files backing one pipeline stage.
//!
//! Entries live as plain files in the queue directory, named
//! `{sequence:016}_{original name}`. The directory is the source of truth:
//! the in-memory index (pending names ordered by sequence, plus the set of
//! checked-out names) only exists for speed and is rebuilt by [`QueueManager::recount`].
//! After a crash every file still on disk is pending again, so delivery is
//! at-least-once.
//!
//! Writes go to a hidden `.tmp-*` file which is synced and then renamed into
//! place, so consumers never observe a partial entry.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::object::FileObject;
use crate::{PipelineError, Result};

/// Width of the zero-padded sequence prefix.
const SEQ_WIDTH: usize = 16;

/// Prefix of in-flight temporary files; never counted as entries.
const TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Default)]
struct QueueIndex {
    /// Entries waiting for a worker, in arrival order.
    pending: BTreeSet<String>,
    /// Entries handed to a worker and not yet released or requeued.
    checked_out: HashSet<String>,
    /// Next sequence number to assign.
    next_seq: u64,
}

/// Persistent queue of files owned by exactly one consuming stage.
#[derive(Debug)]
pub struct QueueManager {
    root: PathBuf,
    index: Mutex<QueueIndex>,
}

impl QueueManager {
    /// Open (creating if needed) the queue rooted at `root` and rebuild its
    /// index from whatever is on disk. Stale temporary files left by an
    /// interrupted write are removed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| PipelineError::io_path("creating queue directory", &root, e))?;
        let root = tokio::fs::canonicalize(&root)
            .await
            .map_err(|e| PipelineError::io_path("resolving queue directory", &root, e))?;

        let queue = Self {
            root,
            index: Mutex::new(QueueIndex::default()),
        };
        queue.remove_stale_temp_files().await?;
        let size = queue.recount().await?;
        info!(queue = %queue.root.display(), size, "Queue opened");
        Ok(queue)
    }

    /// Directory holding the queue entries.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of entries waiting to be checked out.
    pub fn size(&self) -> usize {
        self.index.lock().pending.len()
    }

    /// Number of entries currently checked out by workers.
    pub fn checked_out(&self) -> usize {
        self.index.lock().checked_out.len()
    }

    /// Copy `source` into the queue at the tail. The source is left untouched.
    ///
    /// Returns the path of the new entry.
    pub async fn enqueue(&self, source: &Path) -> Result<PathBuf> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| Self::embedded_filename(n).unwrap_or(n).to_string())
            .ok_or_else(|| {
                PipelineError::Queue(format!("cannot enqueue {}: no file name", source.display()))
            })?;
        self.enqueue_as(source, &name).await
    }

    /// Copy the file backing `object` into the queue at the tail.
    pub async fn enqueue_object(&self, object: &FileObject) -> Result<PathBuf> {
        self.enqueue(object.path()).await
    }

    /// Copy `source` into the queue under the given embedded name.
    pub async fn enqueue_as(&self, source: &Path, name: &str) -> Result<PathBuf> {
        let temp = self.temp_path();
        if let Err(e) = self.write_temp(source, &temp).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
        self.commit(&temp, name).await
    }

    /// A fresh hidden path inside the queue directory.
    ///
    /// Producers that stream content (rather than copy an existing file) write
    /// here and then hand the file over with [`enqueue_temp`](Self::enqueue_temp).
    pub fn temp_path(&self) -> PathBuf {
        self.root
            .join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4().simple()))
    }

    /// Move a fully written file obtained from [`temp_path`](Self::temp_path)
    /// to the tail of the queue under `name`.
    pub async fn enqueue_temp(&self, temp: &Path, name: &str) -> Result<PathBuf> {
        if temp.parent() != Some(self.root.as_path()) {
            return Err(PipelineError::Queue(format!(
                "{} is not a temporary file of {}",
                temp.display(),
                self.root.display()
            )));
        }
        let file = tokio::fs::File::open(temp)
            .await
            .map_err(|e| PipelineError::io_path("opening queue entry", temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| PipelineError::io_path("syncing queue entry", temp, e))?;
        self.commit(temp, name).await
    }

    async fn commit(&self, temp: &Path, name: &str) -> Result<PathBuf> {
        let name = sanitize_entry_name(name);
        let entry = {
            let mut index = self.index.lock();
            let seq = index.next_seq;
            index.next_seq += 1;
            format!("{:0width$}_{}", seq, name, width = SEQ_WIDTH)
        };
        let target = self.root.join(&entry);

        if let Err(e) = tokio::fs::rename(temp, &target).await {
            let _ = tokio::fs::remove_file(temp).await;
            return Err(PipelineError::io_path("committing queue entry", &target, e));
        }

        self.index.lock().pending.insert(entry);
        debug!(queue = %self.root.display(), entry = %target.display(), "Enqueued");
        Ok(target)
    }

    async fn write_temp(&self, source: &Path, temp: &Path) -> Result<()> {
        tokio::fs::copy(source, temp)
            .await
            .map_err(|e| PipelineError::io_path("copying into queue", source, e))?;
        let file = tokio::fs::File::open(temp)
            .await
            .map_err(|e| PipelineError::io_path("opening queue entry", temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| PipelineError::io_path("syncing queue entry", temp, e))?;
        Ok(())
    }

    /// Check out the oldest pending entry without blocking.
    ///
    /// Entries that vanished from disk behind the queue's back are skipped.
    /// A checked-out entry must later be passed to [`release`](Self::release)
    /// or [`requeue`](Self::requeue).
    pub async fn next_file(&self) -> Option<PathBuf> {
        loop {
            let name = {
                let mut index = self.index.lock();
                let name = index.pending.pop_first()?;
                index.checked_out.insert(name.clone());
                name
            };
            let path = self.root.join(&name);
            match tokio::fs::try_exists(&path).await {
                Ok(true) => return Some(path),
                _ => {
                    debug!(entry = %path.display(), "Queue entry disappeared; skipping");
                    self.index.lock().checked_out.remove(&name);
                }
            }
        }
    }

    /// Permanently remove a checked-out entry.
    ///
    /// The file is only deleted if it still resides in this queue's directory;
    /// a stage may have moved it elsewhere (quarantine, storage), in which case
    /// only the bookkeeping is dropped. Returns whether a file was deleted.
    pub async fn release(&self, path: &Path) -> Result<bool> {
        let Some(name) = self.entry_name(path) else {
            return Ok(false);
        };
        {
            let mut index = self.index.lock();
            index.checked_out.remove(&name);
            index.pending.remove(&name);
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PipelineError::io_path("releasing queue entry", path, e)),
        }
    }

    /// Hand a checked-out entry back without touching the file. It keeps its
    /// place in the sequence, so it is the next one served. Returns false if
    /// `path` was not checked out from this queue.
    pub fn return_to_pending(&self, path: &Path) -> bool {
        let Some(name) = self.entry_name(path) else {
            return false;
        };
        let mut index = self.index.lock();
        if !index.checked_out.remove(&name) {
            return false;
        }
        index.pending.insert(name);
        true
    }

    /// Move a checked-out entry to the tail of the queue: its content is copied
    /// into a new entry and the original file is deleted.
    pub async fn requeue(&self, path: &Path) -> Result<PathBuf> {
        let new_path = self.enqueue(path).await?;
        self.release(path).await?;
        Ok(new_path)
    }

    /// Rebuild the index by rescanning the directory.
    ///
    /// Files dropped into the directory by hand (names without a sequence
    /// prefix) are adopted at the tail. Checked-out entries that are still on
    /// disk stay checked out. Returns the pending count.
    pub async fn recount(&self) -> Result<usize> {
        let mut on_disk = BTreeSet::new();
        let mut foreign = Vec::new();
        let mut max_seq: Option<u64> = None;

        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| PipelineError::io_path("scanning queue", &self.root, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::io_path("scanning queue", &self.root, e))?
        {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match parse_sequence(&name) {
                Some(seq) => {
                    max_seq = Some(max_seq.map_or(seq, |m| m.max(seq)));
                    on_disk.insert(name);
                }
                None => foreign.push(name),
            }
        }

        {
            let mut index = self.index.lock();
            if let Some(max) = max_seq {
                index.next_seq = index.next_seq.max(max + 1);
            }
            index.checked_out.retain(|name| on_disk.contains(name));
            let checked_out = &index.checked_out;
            let pending: BTreeSet<String> = on_disk
                .into_iter()
                .filter(|name| !checked_out.contains(name))
                .collect();
            index.pending = pending;
        }

        for name in foreign {
            self.adopt(&name).await;
        }

        Ok(self.size())
    }

    /// Give a hand-copied file a sequence name at the tail.
    async fn adopt(&self, name: &str) {
        let entry = {
            let mut index = self.index.lock();
            let seq = index.next_seq;
            index.next_seq += 1;
            format!("{:0width$}_{}", seq, sanitize_entry_name(name), width = SEQ_WIDTH)
        };
        let from = self.root.join(name);
        let to = self.root.join(&entry);
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => {
                debug!(from = %from.display(), to = %to.display(), "Adopted foreign queue file");
                self.index.lock().pending.insert(entry);
            }
            Err(e) => warn!(path = %from.display(), error = %e, "Unable to adopt queue file"),
        }
    }

    async fn remove_stale_temp_files(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| PipelineError::io_path("scanning queue", &self.root, e))?;
        while let Some(entry) = entries.next_entry().await? {
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(TEMP_PREFIX));
            if is_temp {
                let path = entry.path();
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => info!(path = %path.display(), "Removed partial queue entry"),
                    Err(e) => warn!(path = %path.display(), error = %e, "Unable to remove partial queue entry"),
                }
            }
        }
        Ok(())
    }

    /// Name of `path` inside this queue, if it is a direct child of the queue directory.
    fn entry_name(&self, path: &Path) -> Option<String> {
        if path.parent()? != self.root {
            return None;
        }
        path.file_name()?.to_str().map(str::to_string)
    }

    /// Recover the original file name embedded in a queue entry name.
    ///
    /// Returns `None` when `name` is not a queue entry name.
    pub fn embedded_filename(name: &str) -> Option<&str> {
        let (seq, rest) = name.split_once('_')?;
        (seq.len() == SEQ_WIDTH && seq.bytes().all(|b| b.is_ascii_digit()) && !rest.is_empty())
            .then_some(rest)
    }
}

fn parse_sequence(name: &str) -> Option<u64> {
    let (seq, rest) = name.split_once('_')?;
    if seq.len() != SEQ_WIDTH || rest.is_empty() {
        return None;
    }
    seq.parse().ok()
}

fn sanitize_entry_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "object".to_string()
    } else {
        trimmed.to_string()
    }
}
