// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 bhdir contributors

//! Persistent UUID-to-path index.
//!
//! Answers "where does this UUID live?" in O(log N) without walking the
//! data tree. The on-disk form is `MD5(payload) || payload` where payload
//! is the AVL tree's preorder byte stream; the checksum rejects files the
//! sync engine delivered half-written, in which case a full rebuild scan
//! repairs the index.

pub mod avl;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::filer::Filer;
use crate::path::{Mounts, ROOT_FOLDER};
use crate::record::{BUCKET_FILE, Bucket};
use avl::AvlTree;

/// On-disk index file name, versioned by suffix.
pub const INDEX_FILE: &str = ".index.1";

/// How often the save timer persists a dirty tree.
pub const SAVE_INTERVAL: Duration = Duration::from_secs(1);

/// What an indexed UUID points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// A variable record in a bucket file.
    Var,
    /// A history entry.
    History,
    /// An uploaded blob payload.
    File,
}

/// One index entry: entity kind plus its namespace path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Entity kind.
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Canonical namespace path, folder prefix included.
    pub path: String,
}

/// The UUID index: an in-memory AVL tree plus checksum-sealed persistence.
#[derive(Debug)]
pub struct Index {
    tree: Mutex<AvlTree>,
    dirty: AtomicBool,
    saving: AtomicBool,
    file: PathBuf,
    filer: Arc<Filer>,
}

/// A UUID as the tree's unsigned 128-bit key, big-endian byte order.
fn key_of(uuid: Uuid) -> u128 {
    u128::from_be_bytes(*uuid.as_bytes())
}

impl Index {
    /// Creates an index persisted at `file`.
    #[must_use]
    pub fn new(filer: Arc<Filer>, file: PathBuf) -> Self {
        Self {
            tree: Mutex::new(AvlTree::new()),
            dirty: AtomicBool::new(false),
            saving: AtomicBool::new(false),
            file,
            filer,
        }
    }

    /// Number of indexed entries.
    pub async fn len(&self) -> usize {
        self.tree.lock().await.len()
    }

    /// Whether the index is empty.
    pub async fn is_empty(&self) -> bool {
        self.tree.lock().await.is_empty()
    }

    /// Looks up an entry by UUID.
    pub async fn search(&self, uuid: Uuid) -> Option<IndexEntry> {
        let tree = self.tree.lock().await;
        let buf = tree.get(key_of(uuid))?;
        serde_json::from_slice(buf).ok()
    }

    /// Inserts or replaces the entry for `uuid`. The nil UUID is never
    /// indexed; it doubles as the serialization's null marker.
    pub async fn insert(&self, kind: EntryKind, uuid: Uuid, path: &str) {
        if uuid.is_nil() {
            return;
        }
        let entry = IndexEntry {
            kind,
            path: path.to_string(),
        };
        let Ok(buf) = serde_json::to_vec(&entry) else {
            return;
        };
        self.tree.lock().await.insert(key_of(uuid), buf);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Removes the entry for `uuid`, if present.
    pub async fn remove(&self, uuid: Uuid) {
        if self.tree.lock().await.remove(key_of(uuid)) {
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Loads and verifies the on-disk index.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when no index exists yet, [`Error::Corrupt`]
    /// when the checksum or the byte stream does not verify.
    pub async fn load(&self) -> Result<usize> {
        let bytes = self.filer.lock_read(&self.file).await?;
        if bytes.len() < 16 {
            return Err(self.corrupt());
        }
        let (checksum, payload) = bytes.split_at(16);
        if Md5::digest(payload).as_slice() != checksum {
            return Err(self.corrupt());
        }
        let tree = AvlTree::deserialize(payload).ok_or_else(|| self.corrupt())?;
        let len = tree.len();
        *self.tree.lock().await = tree;
        self.dirty.store(false, Ordering::SeqCst);
        debug!("index loaded, {len} entries");
        Ok(len)
    }

    /// Persists the tree: `MD5(payload) || payload` under the filer lock.
    /// A save already in flight suppresses this one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the write fails.
    pub async fn save(&self) -> Result<()> {
        if self.saving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let payload = {
            let tree = self.tree.lock().await;
            self.dirty.store(false, Ordering::SeqCst);
            tree.serialize()
        };
        let mut bytes = Md5::digest(&payload).to_vec();
        bytes.extend_from_slice(&payload);

        let out = self.filer.lock_write(&self.file, &bytes, None).await;
        self.saving.store(false, Ordering::SeqCst);
        if out.is_err() {
            // Keep the tree marked dirty so the timer tries again.
            self.dirty.store(true, Ordering::SeqCst);
        }
        out
    }

    /// Rebuilds the index from a full scan of every attached folder's
    /// bucket files. Returns the number of entries indexed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] or [`Error::Io`] when a bucket stays
    /// unreadable past the filer's retry budget.
    pub async fn build(&self, mounts: &Mounts) -> Result<usize> {
        let mut fresh = AvlTree::new();

        for (folder, dir) in mounts.attached() {
            let mut stack = vec![(dir, String::new())];
            while let Some((dir, rooted)) = stack.pop() {
                let bucket_file = dir.join(BUCKET_FILE);
                if bucket_file.exists() {
                    let bucket: Bucket = self.filer.lock_read_json(&bucket_file).await?;
                    for (leaf, var) in &bucket {
                        if var.id.is_nil() {
                            continue;
                        }
                        let path = canonical(&folder, &format!("{rooted}/{leaf}"));
                        let entry = IndexEntry {
                            kind: EntryKind::Var,
                            path,
                        };
                        if let Ok(buf) = serde_json::to_vec(&entry) {
                            fresh.insert(key_of(var.id), buf);
                        }
                    }
                }

                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(Error::io(&dir, e)),
                };
                while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(&dir, e))?
                {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with('.') {
                        continue;
                    }
                    let is_dir = entry
                        .file_type()
                        .await
                        .map_err(|e| Error::io(&entry.path(), e))?
                        .is_dir();
                    if is_dir {
                        stack.push((entry.path(), format!("{rooted}/{name}")));
                    }
                }
            }
        }

        let len = fresh.len();
        *self.tree.lock().await = fresh;
        self.dirty.store(true, Ordering::SeqCst);
        info!("index rebuilt, {len} entries");
        Ok(len)
    }

    /// Spawns the 1-second save timer persisting the tree whenever dirty.
    #[must_use]
    pub fn spawn_save_timer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let index = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAVE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if index.dirty.load(Ordering::SeqCst)
                    && let Err(e) = index.save().await
                {
                    warn!("index save failed: {e}");
                }
            }
        })
    }

    fn corrupt(&self) -> Error {
        Error::Corrupt {
            path: self.file.display().to_string(),
            attempts: 1,
        }
    }
}

fn canonical(folder: &str, rooted: &str) -> String {
    if folder == ROOT_FOLDER {
        rooted.to_string()
    } else {
        format!("{folder}:{rooted}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests use unwrap for brevity")]
mod tests {
    use super::*;
    use crate::filer::FileMeta;

    fn index_at(dir: &std::path::Path) -> Index {
        let filer = Arc::new(Filer::new(
            Uuid::new_v4(),
            FileMeta::default(),
            FileMeta::default(),
        ));
        Index::new(filer, dir.join(INDEX_FILE))
    }

    #[tokio::test]
    async fn insert_search_remove() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_at(dir.path());
        let id = Uuid::new_v4();

        index.insert(EntryKind::Var, id, "/cfg/host").await;
        let entry = index.search(id).await.unwrap();
        assert_eq!(entry.kind, EntryKind::Var);
        assert_eq!(entry.path, "/cfg/host");

        index.remove(id).await;
        assert!(index.search(id).await.is_none());
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_at(dir.path());

        let mut ids = Vec::new();
        for i in 0..32 {
            let id = Uuid::new_v4();
            index
                .insert(EntryKind::Var, id, &format!("/records/r{i}"))
                .await;
            ids.push((id, format!("/records/r{i}")));
        }
        index.save().await.unwrap();

        let fresh = index_at(dir.path());
        assert_eq!(fresh.load().await.unwrap(), 32);
        for (id, path) in ids {
            assert_eq!(fresh.search(id).await.unwrap().path, path);
        }
    }

    #[tokio::test]
    async fn corrupted_byte_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_at(dir.path());
        index.insert(EntryKind::File, Uuid::new_v4(), "/img/a").await;
        index.save().await.unwrap();

        // Flip one payload byte; the seal must reject the file.
        let file = dir.path().join(INDEX_FILE);
        let mut bytes = std::fs::read(&file).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&file, bytes).unwrap();

        let fresh = index_at(dir.path());
        assert!(matches!(
            fresh.load().await.unwrap_err(),
            Error::Corrupt { .. }
        ));
    }

    #[tokio::test]
    async fn missing_index_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_at(dir.path());
        assert!(matches!(
            index.load().await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn entry_json_shape() {
        let entry = IndexEntry {
            kind: EntryKind::History,
            path: "/a/b".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, "{\"type\":\"history\",\"path\":\"/a/b\"}");
    }
}
