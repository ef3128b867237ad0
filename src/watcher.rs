// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 bhdir contributors

//! Observes remote mutations and keeps this node coherent.
//!
//! Peers announce writes by dropping journal files into the shared
//! `updates/` directory; the sync engine replicates both the journal and
//! the bucket it describes, in no particular order. The watcher therefore
//! splits delivery in two: a journal entry *invalidates* the cache at once
//! and arms a pending read with the expected `mtime`; the fresh record is
//! delivered to cache and waiters only once the bucket file has visibly
//! caught up and parses. A sweep timer provides liveness when filesystem
//! events are lost and evicts old journal files.

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::cacher::Cacher;
use crate::error::{Error, Result};
use crate::events::NotifyHub;
use crate::filer::Filer;
use crate::path::{DirPath, Mounts};
use crate::record::{Bucket, JournalEvent, JournalFile};

/// Sweep cadence: re-scan, retry pending reads, evict old journals.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Tracked journal files and armed pending reads older than this are
/// evicted; the journal files are deleted from disk too.
pub const TRACKED_MAX_AGE: Duration = Duration::from_secs(600);

/// A journal file already seen this run.
#[derive(Debug)]
struct TrackedJournal {
    first_seen: Instant,
}

/// A read armed by an `update` journal entry, delivered once the bucket's
/// observed mtime catches up with the writer's.
#[derive(Debug, Clone)]
struct PendingRead {
    expected_mtime: u32,
    var_path: String,
    armed: Instant,
}

/// The filesystem watcher and journal fan-out.
pub struct Watcher {
    filer: Arc<Filer>,
    cacher: Arc<Cacher>,
    hub: Arc<NotifyHub>,
    mounts: Arc<Mounts>,
    tracked: Mutex<HashMap<String, TrackedJournal>>,
    pending: Mutex<HashMap<PathBuf, Vec<PendingRead>>>,
    fs_watcher: std::sync::Mutex<RecommendedWatcher>,
    updates_watched: AtomicBool,
}

impl Watcher {
    /// Builds the watcher, subscribes to the root (and the updates
    /// directory when it already exists) and spawns the event loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the filesystem subscription cannot be
    /// established.
    pub fn start(
        filer: Arc<Filer>,
        cacher: Arc<Cacher>,
        hub: Arc<NotifyHub>,
        mounts: Arc<Mounts>,
    ) -> Result<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let fs_watcher = RecommendedWatcher::new(
            move |event: std::result::Result<notify::Event, notify::Error>| {
                let _ = tx.send(event);
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::Io {
            path: mounts.root().display().to_string(),
            source: std::io::Error::other(e),
        })?;

        let watcher = Arc::new(Self {
            filer,
            cacher,
            hub,
            mounts,
            tracked: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            fs_watcher: std::sync::Mutex::new(fs_watcher),
            updates_watched: AtomicBool::new(false),
        });

        watcher.watch_path(watcher.mounts.root(), RecursiveMode::NonRecursive)?;

        let handle = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move {
                watcher.ensure_updates_watch().await;
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        maybe = rx.recv() => {
                            match maybe {
                                Some(Ok(event)) => watcher.handle_event(event).await,
                                Some(Err(e)) => warn!("watch error: {e}"),
                                None => break,
                            }
                        }
                        _ = ticker.tick() => watcher.sweep().await,
                    }
                }
                debug!("watcher event loop ended");
            })
        };

        Ok((watcher, handle))
    }

    /// One watcher cycle over the drop-directory: pick up journal files
    /// not yet tracked and fan their entries out.
    pub async fn scan_updates(&self) {
        let updates_dir = self.mounts.updates_dir();
        let Ok(mut entries) = tokio::fs::read_dir(&updates_dir).await else {
            return;
        };

        let mut fresh = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_journal_name(&name) {
                continue;
            }
            let mut tracked = self.tracked.lock().await;
            if tracked.contains_key(&name) {
                continue;
            }
            tracked.insert(
                name,
                TrackedJournal {
                    first_seen: Instant::now(),
                },
            );
            fresh.push(entry.path());
        }

        for path in fresh {
            self.process_journal(&path).await;
        }
    }

    /// Number of armed pending reads, for diagnostics.
    pub async fn pending_read_count(&self) -> usize {
        self.pending.lock().await.values().map(Vec::len).sum()
    }

    async fn handle_event(&self, event: notify::Event) {
        trace!("fs event: {event:?}");
        let updates_dir = self.mounts.updates_dir();
        let mut scan = false;
        let mut buckets = Vec::new();

        for path in &event.paths {
            if *path == updates_dir || path.parent() == Some(updates_dir.as_path()) {
                scan = true;
            } else if self.pending.lock().await.contains_key(path) {
                buckets.push(path.clone());
            } else if let Some(parent) = path.parent()
                && self.pending.lock().await.contains_key(parent)
            {
                // Some backends report the directory, not the file.
                buckets.push(parent.to_path_buf());
            }
        }

        if scan {
            self.ensure_updates_watch().await;
            self.scan_updates().await;
        }
        for bucket in buckets {
            self.try_pending(&bucket).await;
        }
    }

    /// Reads one journal file (with the data-retry loop) and fans out its
    /// entries. Processing is idempotent; this node's own journals pass
    /// through here too.
    async fn process_journal(&self, path: &Path) {
        let journal: JournalFile = match self.filer.lock_read_json(path).await {
            Ok(journal) => journal,
            Err(Error::NotFound(_)) => return,
            Err(e) => {
                warn!("journal {} unreadable: {e}", path.display());
                return;
            }
        };

        for var in journal.vars {
            match var.event {
                JournalEvent::Delete => {
                    debug!("journal delete {}", var.path);
                    self.cacher.unset(&var.path).await;
                    self.hub.notify(&var.path, None);
                }
                JournalEvent::Update => {
                    let Ok(parsed) = DirPath::parse(&var.path) else {
                        warn!("journal names invalid path {}", var.path);
                        continue;
                    };
                    let Ok(entry) = self.mounts.entry_path(&parsed) else {
                        debug!("journal names unattached folder {}", var.path);
                        continue;
                    };
                    debug!("journal update {} (mtime {})", var.path, var.mtime);
                    self.cacher.unset(&var.path).await;

                    // A blob upload journals its literal file path; no
                    // bucket rewrite will ever catch up to it, so the
                    // invalidation above is the whole job.
                    if tokio::fs::metadata(&entry).await.is_ok_and(|m| m.is_file()) {
                        debug!("journal update {} is a blob payload", var.path);
                        continue;
                    }

                    let Ok(bucket_file) = self.mounts.bucket_file(&parsed) else {
                        continue;
                    };
                    self.arm_pending(&bucket_file, var.mtime, parsed.canonical())
                        .await;
                    self.try_pending(&bucket_file).await;
                }
            }
        }
    }

    async fn arm_pending(&self, bucket_file: &Path, expected_mtime: u32, var_path: String) {
        self.pending
            .lock()
            .await
            .entry(bucket_file.to_path_buf())
            .or_default()
            .push(PendingRead {
                expected_mtime,
                var_path,
                armed: Instant::now(),
            });

        // Watch the bucket file itself when possible, else its directory.
        if self
            .watch_path(bucket_file, RecursiveMode::NonRecursive)
            .is_err()
            && let Some(parent) = bucket_file.parent()
        {
            let _ = self.watch_path(parent, RecursiveMode::NonRecursive);
        }
    }

    /// Delivers pending reads whose bucket has caught up: refreshes the
    /// cache for the journaled paths (and any other leaf already cached)
    /// and wakes waiters.
    async fn try_pending(&self, bucket_file: &Path) {
        let observed = file_mtime_secs(bucket_file).await;

        let due: Vec<PendingRead> = {
            let mut pending = self.pending.lock().await;
            let Some(reads) = pending.get_mut(bucket_file) else {
                return;
            };
            let (ready, later): (Vec<_>, Vec<_>) = reads
                .drain(..)
                .partition(|r| observed.is_some_and(|m| m >= r.expected_mtime));
            if later.is_empty() {
                pending.remove(bucket_file);
            } else {
                *reads = later;
            }
            ready
        };

        if due.is_empty() {
            return;
        }

        let bucket: Bucket = match self.filer.lock_read_json(bucket_file).await {
            Ok(bucket) => bucket,
            Err(Error::NotFound(_)) => {
                // Bucket vanished under the journal entry; the paths are gone.
                for read in due {
                    self.cacher.set(&read.var_path, None).await;
                    self.hub.notify(&read.var_path, None);
                }
                self.unwatch_if_idle(bucket_file).await;
                return;
            }
            Err(e) => {
                warn!("bucket {} unreadable, re-arming: {e}", bucket_file.display());
                self.pending
                    .lock()
                    .await
                    .entry(bucket_file.to_path_buf())
                    .or_default()
                    .extend(due);
                return;
            }
        };

        let mut delivered = Vec::new();
        for read in due {
            let leaf = read.var_path.rsplit('/').next().unwrap_or_default();
            let record = bucket.get(leaf).cloned();
            self.cacher.set(&read.var_path, record.clone()).await;
            self.hub.notify(&read.var_path, record);
            delivered.push(read.var_path);
        }

        // Refresh sibling leaves the cache already holds.
        if let Some(sample) = delivered.first()
            && let Ok(parsed) = DirPath::parse(sample)
        {
            for (leaf, var) in &bucket {
                let sibling = parsed.sibling(leaf);
                if delivered.contains(&sibling) {
                    continue;
                }
                if self.cacher.get(&sibling).await.is_some() {
                    self.cacher.set(&sibling, Some(var.clone())).await;
                    self.hub.notify(&sibling, Some(var.clone()));
                }
            }
        }

        self.unwatch_if_idle(bucket_file).await;
    }

    /// The sweep: liveness for lost events, then eviction of old journals
    /// and of pending reads whose bucket never caught up.
    async fn sweep(&self) {
        self.ensure_updates_watch().await;
        self.scan_updates().await;

        let buckets: Vec<PathBuf> = self.pending.lock().await.keys().cloned().collect();
        for bucket in buckets {
            self.try_pending(&bucket).await;
        }

        // A pending read whose expected mtime never arrives (a lost write,
        // or a journal that raced its payload) ages out like a tracked
        // journal; its file watch goes with it.
        let stale_buckets: Vec<PathBuf> = {
            let mut pending = self.pending.lock().await;
            let mut stale = Vec::new();
            pending.retain(|bucket, reads| {
                reads.retain(|read| read.armed.elapsed() <= TRACKED_MAX_AGE);
                if reads.is_empty() {
                    stale.push(bucket.clone());
                    false
                } else {
                    true
                }
            });
            stale
        };
        for bucket in stale_buckets {
            debug!("evicting stale pending read on {}", bucket.display());
            if let Ok(mut fs_watcher) = self.fs_watcher.lock() {
                let _ = fs_watcher.unwatch(&bucket);
            }
        }

        let updates_dir = self.mounts.updates_dir();
        let expired: Vec<String> = {
            let mut tracked = self.tracked.lock().await;
            let expired: Vec<String> = tracked
                .iter()
                .filter(|(_, t)| t.first_seen.elapsed() > TRACKED_MAX_AGE)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &expired {
                tracked.remove(name);
            }
            expired
        };
        for name in expired {
            let path = updates_dir.join(&name);
            if let Err(e) = tokio::fs::remove_file(&path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("evicting journal {} failed: {e}", path.display());
            }
        }
    }

    /// Installs the updates-directory subscription once it exists.
    async fn ensure_updates_watch(&self) {
        if self.updates_watched.load(Ordering::SeqCst) {
            return;
        }
        let updates_dir = self.mounts.updates_dir();
        if !updates_dir.is_dir() {
            return;
        }
        if self
            .watch_path(&updates_dir, RecursiveMode::NonRecursive)
            .is_ok()
        {
            self.updates_watched.store(true, Ordering::SeqCst);
            debug!("updates directory watch installed");
            self.scan_updates().await;
        }
    }

    async fn unwatch_if_idle(&self, bucket_file: &Path) {
        if self.pending.lock().await.contains_key(bucket_file) {
            return;
        }
        if let Ok(mut fs_watcher) = self.fs_watcher.lock() {
            let _ = fs_watcher.unwatch(bucket_file);
        }
    }

    fn watch_path(&self, path: &Path, mode: RecursiveMode) -> Result<()> {
        let mut fs_watcher = self
            .fs_watcher
            .lock()
            .map_err(|_| Error::Protocol("watcher mutex poisoned".to_string()))?;
        fs_watcher.watch(path, mode).map_err(|e| Error::Io {
            path: path.display().to_string(),
            source: std::io::Error::other(e),
        })
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("root", self.mounts.root())
            .finish_non_exhaustive()
    }
}

/// Whether a file name looks like `<timestamp>.<sessionId>.<ordinal>.json`.
#[must_use]
pub fn is_journal_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".json") else {
        return false;
    };
    let Some((ts, rest)) = stem.split_once('.') else {
        return false;
    };
    let Some((session, ordinal)) = rest.rsplit_once('.') else {
        return false;
    };
    !ts.is_empty()
        && ts.bytes().all(|b| b.is_ascii_digit())
        && !session.is_empty()
        && !ordinal.is_empty()
        && ordinal.bytes().all(|b| b.is_ascii_digit())
}

/// A file's mtime as UTC seconds, when it exists.
async fn file_mtime_secs(path: &Path) -> Option<u32> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let modified = meta.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    u32::try_from(secs).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests use unwrap for brevity")]
mod tests {
    use super::*;

    #[test]
    fn journal_names() {
        assert!(is_journal_name(
            "1700000000.9c5e9d8e-0000-4000-8000-123456789abc.3.json"
        ));
        assert!(is_journal_name("1700000000.other.1.json"));
        assert!(!is_journal_name("1700000000.json"));
        assert!(!is_journal_name("notes.txt"));
        assert!(!is_journal_name(".vars.json"));
        assert!(!is_journal_name("1700000000.abc.x.json"));
        assert!(!is_journal_name("x.abc.1.json"));
    }
}
