// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 bhdir contributors

//! Variable CRUD over the shared filesystem.
//!
//! Every mutation follows the same discipline: build the post-write record,
//! publish it to the local cache *first* (so concurrent local reads already
//! see the intended value), then merge it into the bucket file under the
//! filer's lock, append a history entry, drop a journal file for peers and
//! wake local waiters. Remote mutations arrive through the watcher, which
//! feeds the same cache and notify hub.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cacher::Cacher;
use crate::error::{Error, Result};
use crate::events::{NotifyHub, WaitOutcome};
use crate::filer::Filer;
use crate::index::{EntryKind, Index};
use crate::path::{DirPath, Mounts, ROOT_FOLDER};
use crate::record::{
    Bucket, FOLDER_META_FILE, FORMAT_CURRENT, FORMAT_LEGACY, FolderMeta, HISTORY_DIR,
    HistoryEntry, JournalEvent, JournalFile, JournalVar, UpgradeMark, Variable, now_secs,
    parse_bucket, to_disk_json,
};

/// The directory service: CRUD, attributes, history, folders, wait.
pub struct Directory {
    filer: Arc<Filer>,
    cacher: Arc<Cacher>,
    index: Arc<Index>,
    hub: Arc<NotifyHub>,
    mounts: Arc<Mounts>,
    session_id: Uuid,
    journal_seq: AtomicU64,
}

impl Directory {
    /// Opens the directory service on its data root: creates the shared
    /// layout (root folder, updates and state directories) and attaches
    /// every folder already present, upgrading legacy ones.
    ///
    /// # Errors
    ///
    /// [`Error::Upgrade`] when another session is mid-upgrade on a folder;
    /// [`Error::Io`] or [`Error::Corrupt`] on filesystem trouble.
    pub async fn open(
        filer: Arc<Filer>,
        cacher: Arc<Cacher>,
        index: Arc<Index>,
        hub: Arc<NotifyHub>,
        mounts: Arc<Mounts>,
        session_id: Uuid,
    ) -> Result<Self> {
        let dir = Self {
            filer,
            cacher,
            index,
            hub,
            mounts,
            session_id,
            journal_seq: AtomicU64::new(0),
        };

        dir.filer
            .create_directory(&dir.mounts.updates_dir(), None)
            .await?;
        dir.filer
            .create_directory(&dir.mounts.state_dir(), None)
            .await?;

        dir.attach_folder(ROOT_FOLDER, true).await?;

        // Attach every sibling folder carrying a metadata marker.
        let root = dir.mounts.root().clone();
        let mut entries = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| Error::io(&root, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(&root, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == ROOT_FOLDER || !crate::path::validate_folder_name(&name) {
                continue;
            }
            if entry.path().join(FOLDER_META_FILE).exists() {
                dir.attach_folder(&name, false).await?;
            }
        }

        Ok(dir)
    }

    /// The session id this daemon writes into journals and upgrade marks.
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Whether `path` is syntactically valid, folder prefix included.
    #[must_use]
    pub fn validate_path(path: &str) -> bool {
        DirPath::parse(path).is_ok()
    }

    /// Reads the record at `path`, or `None` when absent.
    ///
    /// # Errors
    ///
    /// [`Error::Corrupt`] when the bucket stays unreadable, [`Error::Io`]
    /// on filesystem failure, [`Error::InvalidPath`] on bad syntax.
    pub async fn get(&self, path: &str, cache: bool) -> Result<Option<Variable>> {
        let parsed = DirPath::parse(path)?;
        let key = parsed.canonical();

        if cache && let Some(slot) = self.cacher.get(&key).await {
            return Ok(slot);
        }

        let bucket_file = self.mounts.bucket_file(&parsed)?;
        let bucket = self.read_bucket(&bucket_file).await?;
        let record = bucket.get(parsed.leaf()).cloned();
        self.cacher.set(&key, record.clone()).await;
        Ok(record)
    }

    /// Writes `path`. Either a full `record` or a plain `value` may be
    /// supplied. Writing a value equal to the current one is a no-op and
    /// returns `None`; otherwise the new history entry's UUID is returned.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPath`], [`Error::Corrupt`], [`Error::Io`].
    pub async fn set(
        &self,
        path: &str,
        record: Option<Variable>,
        value: Option<Value>,
    ) -> Result<Option<Uuid>> {
        let parsed = DirPath::parse(path)?;
        let current = self.get(path, false).await?;

        if record.is_none()
            && let (Some(cur), Some(val)) = (&current, &value)
            && cur.value_equals(val)
        {
            debug!("set {path}: unchanged value, skipping write");
            return Ok(None);
        }

        let now = now_secs();
        let next = match (current, record) {
            (Some(cur), Some(mut given)) => {
                given.id = cur.id;
                given.ctime = cur.ctime;
                given.mtime = now.max(cur.ctime);
                given
            }
            (None, Some(mut given)) => {
                if given.id.is_nil() {
                    given.id = Uuid::new_v4();
                }
                given.ctime = if given.ctime == 0 { now } else { given.ctime };
                given.mtime = now.max(given.ctime);
                given
            }
            (Some(cur), None) => {
                let mut next = cur.clone();
                next.mtime = now.max(cur.ctime);
                if let Some(val) = value {
                    next.value = val;
                }
                next
            }
            (None, None) => Variable::new(value.unwrap_or(Value::Null)),
        };

        self.commit(&parsed, next).await.map(Some)
    }

    /// Deletes `path`: drops the leaf from its bucket, removes the
    /// variable's history subtree, journals the deletion and notifies.
    /// Deleting an absent variable is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPath`], [`Error::Io`], [`Error::Corrupt`].
    pub async fn del(&self, path: &str) -> Result<()> {
        let parsed = DirPath::parse(path)?;
        let key = parsed.canonical();
        let bucket_file = self.mounts.bucket_file(&parsed)?;

        let mut removed: Option<Variable> = None;
        let leaf = parsed.leaf().to_string();
        self.filer
            .lock_update(
                &bucket_file,
                |bytes| {
                    let mut bucket = parse_bucket(bytes, &bucket_file)?;
                    bucket.remove(&leaf).map_or(Ok(None), |var| {
                        removed = Some(var);
                        to_disk_json(&bucket).map(Some)
                    })
                },
                None,
            )
            .await?;

        let Some(var) = removed else {
            return Ok(());
        };

        let history = self.mounts.entry_path(&parsed)?.join(HISTORY_DIR);
        self.filer.remove(&history).await?;
        self.index.remove(var.id).await;
        self.cacher.set(&key, None).await;
        self.journal(JournalEvent::Delete, &key, now_secs()).await?;
        self.hub.notify(&key, None);
        info!("deleted {key}");
        Ok(())
    }

    /// Lists the variables directly under directory `path` as
    /// leaf name to value.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPath`], [`Error::Corrupt`], [`Error::Io`].
    pub async fn ls(&self, path: &str) -> Result<BTreeMap<String, Value>> {
        let parsed = DirPath::parse(path)?;
        let dir = self.mounts.entry_path(&parsed)?;
        let bucket = self.read_bucket(&dir.join(crate::record::BUCKET_FILE)).await?;
        Ok(bucket
            .into_iter()
            .map(|(leaf, var)| (leaf, var.value))
            .collect())
    }

    /// Whether a variable exists at `path`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPath`], [`Error::Io`], [`Error::Corrupt`].
    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get(path, true).await?.is_some())
    }

    /// Sets a free attribute. `id`, `ctime` and `mtime` are refused.
    ///
    /// # Errors
    ///
    /// [`Error::ProtectedAttr`], [`Error::NotFound`] when the variable is
    /// absent, plus the usual read/write errors.
    pub async fn set_attr(&self, path: &str, name: &str, value: Value) -> Result<Uuid> {
        if Variable::is_protected(name) {
            return Err(Error::ProtectedAttr(name.to_string()));
        }
        let parsed = DirPath::parse(path)?;
        let mut next = self
            .get(path, false)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        next.attrs.insert(name.to_string(), value);
        next.mtime = now_secs().max(next.ctime);
        self.commit(&parsed, next).await
    }

    /// Reads an attribute, or `None` when unset. Protected attributes are
    /// readable here, just not writable.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the variable is absent.
    pub async fn get_attr(&self, path: &str, name: &str) -> Result<Option<Value>> {
        let var = self
            .get(path, true)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        let value = match name {
            "id" => Some(Value::String(var.id.to_string())),
            "ctime" => Some(Value::from(var.ctime)),
            "mtime" => Some(Value::from(var.mtime)),
            _ => var.attrs.get(name).cloned(),
        };
        Ok(value)
    }

    /// Deletes a free attribute.
    ///
    /// # Errors
    ///
    /// [`Error::ProtectedAttr`] for the protected trio, [`Error::NotFound`]
    /// when the variable or the attribute is absent.
    pub async fn del_attr(&self, path: &str, name: &str) -> Result<Uuid> {
        if Variable::is_protected(name) {
            return Err(Error::ProtectedAttr(name.to_string()));
        }
        let parsed = DirPath::parse(path)?;
        let mut next = self
            .get(path, false)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if next.attrs.remove(name).is_none() {
            return Err(Error::NotFound(format!("{path}#{name}")));
        }
        next.mtime = now_secs().max(next.ctime);
        self.commit(&parsed, next).await
    }

    /// Bumps `mtime` without changing anything else.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the variable is absent.
    pub async fn touch(&self, path: &str) -> Result<Uuid> {
        let parsed = DirPath::parse(path)?;
        let mut next = self
            .get(path, false)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        next.mtime = now_secs().max(next.ctime);
        self.commit(&parsed, next).await
    }

    /// Blocks until `path` changes or the deadline fires; zero waits
    /// forever. On timeout the cached value rides along.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPath`] on bad syntax.
    pub async fn wait(&self, path: &str, timeout_ms: u64) -> Result<WaitOutcome> {
        let parsed = DirPath::parse(path)?;
        let key = parsed.canonical();
        let fallback = self
            .get(path, true)
            .await
            .ok()
            .flatten()
            .map_or(Value::Null, |var| var.value);
        Ok(self.hub.wait(&key, timeout_ms, fallback).await)
    }

    /// Stores a blob payload at the literal path beside the bucket file
    /// and indexes its fresh UUID. Returns the blob UUID.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPath`], [`Error::Io`].
    pub async fn upload(&self, path: &str, bytes: &[u8]) -> Result<Uuid> {
        let parsed = DirPath::parse(path)?;
        let key = parsed.canonical();
        let target = self.mounts.entry_path(&parsed)?;

        self.filer.create_directory(&self.mounts.bucket_dir(&parsed)?, None).await?;
        self.filer.lock_write(&target, bytes, None).await?;

        let blob_id = Uuid::new_v4();
        self.index.insert(EntryKind::File, blob_id, &key).await;
        self.journal(JournalEvent::Update, &key, now_secs()).await?;
        info!("uploaded {} bytes to {key}", bytes.len());
        Ok(blob_id)
    }

    /// Reads a blob payload back, or `None` when absent.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPath`], [`Error::Io`].
    pub async fn download(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let parsed = DirPath::parse(path)?;
        let target = self.mounts.entry_path(&parsed)?;
        match self.filer.lock_read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Drops every cache entry, shared backend included.
    pub async fn clear_cache(&self) {
        self.cacher.flush().await;
    }

    /// Creates a new folder mount beside the root folder.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPath`] for a bad name, [`Error::Io`] when the
    /// folder already exists.
    pub async fn create_folder(&self, name: &str) -> Result<()> {
        if !crate::path::validate_folder_name(name) {
            return Err(Error::InvalidPath(name.to_string()));
        }
        if self.mounts.is_attached(name) {
            let dir = self.mounts.root().join(name);
            return Err(Error::io(
                &dir,
                std::io::Error::from(std::io::ErrorKind::AlreadyExists),
            ));
        }
        self.attach_folder(name, true).await
    }

    /// Attaches an existing folder, upgrading it when it still carries the
    /// legacy format.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the directory is absent, [`Error::Upgrade`]
    /// when a foreign session is mid-upgrade.
    pub async fn add_folder(&self, name: &str) -> Result<()> {
        if !crate::path::validate_folder_name(name) {
            return Err(Error::InvalidPath(name.to_string()));
        }
        let dir = self.mounts.root().join(name);
        if !dir.is_dir() {
            return Err(Error::NotFound(dir.display().to_string()));
        }
        self.attach_folder(name, false).await
    }

    /// The canonical cache/notify key for a raw path string.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPath`] on bad syntax.
    pub fn canonical_key(path: &str) -> Result<String> {
        Ok(DirPath::parse(path)?.canonical())
    }

    // ---- internals ----

    /// Shared tail of every mutation: cache first, then bucket merge,
    /// history, index, journal, notify.
    async fn commit(&self, parsed: &DirPath, next: Variable) -> Result<Uuid> {
        let key = parsed.canonical();
        let bucket_dir = self.mounts.bucket_dir(parsed)?;
        let bucket_file = self.mounts.bucket_file(parsed)?;

        // Optimistic: local readers see the new record before it lands.
        self.cacher.set(&key, Some(next.clone())).await;

        self.filer.create_directory(&bucket_dir, None).await?;

        let leaf = parsed.leaf().to_string();
        let record = next.clone();
        self.filer
            .lock_update(
                &bucket_file,
                |bytes| {
                    let mut bucket = parse_bucket(bytes, &bucket_file)?;
                    bucket.insert(leaf.clone(), record.clone());
                    to_disk_json(&bucket).map(Some)
                },
                None,
            )
            .await?;

        let history_id = self.add_history(parsed, &next).await?;
        self.index.insert(EntryKind::Var, next.id, &key).await;
        self.journal(JournalEvent::Update, &key, next.mtime).await?;
        self.hub.notify(&key, Some(next));
        Ok(history_id)
    }

    /// Appends the post-write record under
    /// `<path>/.history/YYYY/MM/DD/HH/NNNN.json`.
    async fn add_history(&self, parsed: &DirPath, record: &Variable) -> Result<Uuid> {
        let mut dir = self.mounts.entry_path(parsed)?.join(HISTORY_DIR);
        let stamp = chrono::DateTime::from_timestamp(i64::from(record.mtime), 0)
            .unwrap_or_default();
        for part in stamp.format("%Y/%m/%d/%H").to_string().split('/') {
            dir.push(part);
        }
        self.filer.create_directory(&dir, None).await?;

        let next_ordinal = next_history_ordinal(&dir).await?;
        let file = dir.join(format!("{next_ordinal:04}.json"));

        let entry = HistoryEntry {
            id: Uuid::new_v4(),
            mtime: record.mtime,
            variable: record.clone(),
        };
        self.filer
            .lock_write(&file, &to_disk_json(&entry)?, None)
            .await?;
        self.index
            .insert(EntryKind::History, entry.id, &parsed.canonical())
            .await;
        Ok(entry.id)
    }

    /// Drops a journal file into the updates directory for peers (and this
    /// node's own watcher) to fan out.
    async fn journal(&self, event: JournalEvent, path: &str, mtime: u32) -> Result<()> {
        let seq = self.journal_seq.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}.{}.{seq}.json", now_secs(), self.session_id);
        let file = self.mounts.updates_dir().join(name);
        let journal = JournalFile {
            vars: vec![JournalVar {
                event,
                path: path.to_string(),
                mtime,
            }],
        };
        self.filer
            .lock_write(&file, &to_disk_json(&journal)?, None)
            .await
    }

    /// Reads a bucket, treating a missing file as empty.
    async fn read_bucket(&self, bucket_file: &Path) -> Result<Bucket> {
        match self.filer.lock_read_json::<Bucket>(bucket_file).await {
            Ok(bucket) => Ok(bucket),
            Err(Error::NotFound(_)) => Ok(Bucket::new()),
            Err(e) => Err(e),
        }
    }

    /// Ensures a folder is attached: creates it when allowed, verifies its
    /// schema marker, and runs the legacy upgrade when needed.
    async fn attach_folder(&self, name: &str, create: bool) -> Result<()> {
        let dir = self.mounts.root().join(name);
        let meta_file = dir.join(FOLDER_META_FILE);

        if !dir.is_dir() {
            if !create {
                return Err(Error::NotFound(dir.display().to_string()));
            }
            self.filer.create_directory(&dir, None).await?;
        }

        let meta: FolderMeta = match self.filer.lock_read_json(&meta_file).await {
            Ok(meta) => meta,
            Err(Error::NotFound(_)) => {
                let fresh = FolderMeta::current();
                self.filer
                    .lock_write(&meta_file, &to_disk_json(&fresh)?, None)
                    .await?;
                fresh
            }
            Err(e) => return Err(e),
        };

        if let Some(session) = meta.directory.upgrading.session()
            && session != self.session_id.to_string()
        {
            return Err(Error::Upgrade {
                folder: name.to_string(),
                session: session.to_string(),
            });
        }

        if meta.directory.format == FORMAT_LEGACY {
            self.upgrade_folder(name, &dir, &meta_file).await?;
        }

        self.mounts.attach(name);
        debug!("folder {name} attached at {}", dir.display());
        Ok(())
    }

    /// One-shot format 1 to 2 conversion: wrap every raw bucket value in a
    /// full record. The upgrade mark keeps other daemons off the folder.
    async fn upgrade_folder(&self, name: &str, dir: &Path, meta_file: &Path) -> Result<()> {
        info!("upgrading folder {name} to format {FORMAT_CURRENT}");
        self.write_folder_meta(meta_file, FORMAT_LEGACY, UpgradeMark::Session(
            self.session_id.to_string(),
        ))
        .await?;

        let mut stack = vec![dir.to_path_buf()];
        while let Some(cursor) = stack.pop() {
            let bucket_file = cursor.join(crate::record::BUCKET_FILE);
            if bucket_file.exists() {
                self.filer
                    .lock_update(
                        &bucket_file,
                        |bytes| {
                            let raw: serde_json::Map<String, Value> =
                                serde_json::from_slice(bytes).map_err(|_| Error::Corrupt {
                                    path: bucket_file.display().to_string(),
                                    attempts: 1,
                                })?;
                            let mut bucket = Bucket::new();
                            for (leaf, value) in raw {
                                let var = serde_json::from_value::<Variable>(value.clone())
                                    .unwrap_or_else(|_| Variable::new(value));
                                bucket.insert(leaf, var);
                            }
                            to_disk_json(&bucket).map(Some)
                        },
                        None,
                    )
                    .await?;
            }

            let mut entries = match tokio::fs::read_dir(&cursor).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::io(&cursor, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::io(&cursor, e))?
            {
                let entry_name = entry.file_name().to_string_lossy().into_owned();
                if entry_name.starts_with('.') {
                    continue;
                }
                if entry
                    .file_type()
                    .await
                    .map_err(|e| Error::io(&entry.path(), e))?
                    .is_dir()
                {
                    stack.push(entry.path());
                }
            }
        }

        self.write_folder_meta(meta_file, FORMAT_CURRENT, UpgradeMark::idle())
            .await?;
        info!("folder {name} upgraded");
        Ok(())
    }

    async fn write_folder_meta(
        &self,
        meta_file: &Path,
        format: u32,
        upgrading: UpgradeMark,
    ) -> Result<()> {
        let meta = FolderMeta {
            directory: crate::record::FolderDirectory { format, upgrading },
        };
        self.filer
            .lock_write(meta_file, &to_disk_json(&meta)?, None)
            .await
    }
}

/// Largest `NNNN.json` ordinal in a history hour-bucket, plus one.
async fn next_history_ordinal(dir: &Path) -> Result<u32> {
    let mut max = 0u32;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
        Err(e) => return Err(Error::io(dir, e)),
    };
    while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(dir, e))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(stem) = name.strip_suffix(".json")
            && !stem.is_empty()
            && stem.bytes().all(|b| b.is_ascii_digit())
            && let Ok(ordinal) = stem.parse::<u32>()
        {
            max = max.max(ordinal);
        }
    }
    Ok(max + 1)
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("session_id", &self.session_id)
            .field("root", self.mounts.root())
            .finish_non_exhaustive()
    }
}
