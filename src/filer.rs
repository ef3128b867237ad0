// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 bhdir contributors

//! Crash-safe file access over the replicated filesystem.
//!
//! Every read and write of a shared path is serialized through a sidecar
//! lock file `P.lock`, visible to other processes on this node and, through
//! the sync engine, to other nodes. Writes go to a temp file and land with
//! an atomic rename so a reader never observes a half-written file from
//! this node; files arriving mid-replication from *other* nodes can still
//! be truncated, which is why JSON reads run inside a bounded retry loop.
//!
//! ## Lock lifecycle
//!
//! 1. **Acquire**: create `P.lock` with `O_CREAT|O_EXCL`.
//! 2. **Collision**: if the existing lock is older than the stale threshold
//!    the owner is presumed dead and the lock is stolen; otherwise back off
//!    exponentially up to a bounded attempt count.
//! 3. **Release**: remove the lock file.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Maximum attempts to obtain a consistent JSON read of a shared file.
pub const DATA_RETRY_MAX: u32 = 5;

/// Delay between consistent-read attempts.
pub const DATA_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Age after which a lock file's owner is presumed dead.
const LOCK_STALE: Duration = Duration::from_secs(30);

/// Maximum lock acquisition attempts before giving up.
const LOCK_RETRY_MAX: u32 = 10;

/// First backoff step; doubles per attempt up to [`LOCK_BACKOFF_CAP`].
const LOCK_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Backoff ceiling.
const LOCK_BACKOFF_CAP: Duration = Duration::from_millis(2000);

/// Permissions and ownership applied to created files or directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileMeta {
    /// Octal permission bits, e.g. `0o644`.
    pub mode: Option<u32>,
    /// Owner uid.
    pub uid: Option<u32>,
    /// Owner gid.
    pub gid: Option<u32>,
}

impl FileMeta {
    /// Applies mode and ownership to an existing path. Ownership failures
    /// are logged and ignored when the daemon lacks the privilege.
    pub(crate) async fn apply(&self, path: &Path) {
        if let Some(mode) = self.mode {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(mode);
            if let Err(e) = tokio::fs::set_permissions(path, perms).await {
                warn!("chmod {} failed: {e}", path.display());
            }
        }
        if self.uid.is_some() || self.gid.is_some() {
            let uid = self.uid.map(nix::unistd::Uid::from_raw);
            let gid = self.gid.map(nix::unistd::Gid::from_raw);
            if let Err(e) = nix::unistd::chown(path, uid, gid) {
                warn!("chown {} failed: {e}", path.display());
            }
        }
    }
}

/// Serializes shared-filesystem access per path.
#[derive(Debug)]
pub struct Filer {
    session_id: Uuid,
    dir_meta: FileMeta,
    file_meta: FileMeta,
}

/// Content written into a lock file so peers can see who holds it.
#[derive(Serialize)]
struct LockOwner<'a> {
    session: &'a str,
    acquired: u32,
}

/// A held path lock. Removing the lock file releases it; dropping the
/// guard without an explicit release removes it synchronously.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Releases the lock.
    pub async fn release(mut self) {
        self.released = true;
        let _ = tokio::fs::remove_file(&self.lock_path).await;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

impl Filer {
    /// Creates a filer applying `dir_meta`/`file_meta` to everything it makes.
    #[must_use]
    pub const fn new(session_id: Uuid, dir_meta: FileMeta, file_meta: FileMeta) -> Self {
        Self {
            session_id,
            dir_meta,
            file_meta,
        }
    }

    /// The default metadata for created files.
    #[must_use]
    pub const fn file_meta(&self) -> FileMeta {
        self.file_meta
    }

    /// Acquires the sidecar lock for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the lock stays contended past the bounded
    /// attempt count or the lock file cannot be created.
    pub async fn acquire(&self, path: &Path) -> Result<LockGuard> {
        let lock_path = lock_path_for(path);
        let session = self.session_id.to_string();
        let mut backoff = LOCK_BACKOFF_BASE;

        for attempt in 0..LOCK_RETRY_MAX {
            let open = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await;

            match open {
                Ok(mut file) => {
                    let owner = LockOwner {
                        session: &session,
                        acquired: crate::record::now_secs(),
                    };
                    let bytes = serde_json::to_vec(&owner).unwrap_or_default();
                    let _ = file.write_all(&bytes).await;
                    return Ok(LockGuard {
                        lock_path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&lock_path).await {
                        debug!("stealing stale lock {}", lock_path.display());
                        let _ = tokio::fs::remove_file(&lock_path).await;
                        continue;
                    }
                    if attempt + 1 < LOCK_RETRY_MAX {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(LOCK_BACKOFF_CAP);
                    }
                }
                Err(e) => return Err(Error::io(&lock_path, e)),
            }
        }

        Err(Error::io(
            &lock_path,
            std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "lock contended past retry budget",
            ),
        ))
    }

    /// Reads the bytes of `path` under its lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the path does not exist, or
    /// [`Error::Io`] on a filesystem failure.
    pub async fn lock_read(&self, path: &Path) -> Result<Vec<u8>> {
        let guard = self.acquire(path).await?;
        let out = tokio::fs::read(path)
            .await
            .map_err(|e| Error::io_or_not_found(path, e));
        guard.release().await;
        out
    }

    /// Reads and parses `path` as JSON under its lock, retrying while the
    /// content looks half-replicated.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if absent, [`Error::Corrupt`] once the retry
    /// budget is exhausted, [`Error::Io`] otherwise.
    pub async fn lock_read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        retry(DATA_RETRY_MAX, DATA_RETRY_INTERVAL, || async move {
            let bytes = self.lock_read(path).await?;
            serde_json::from_slice(&bytes).map_err(|_| Error::Corrupt {
                path: path.display().to_string(),
                attempts: 1,
            })
        })
        .await
    }

    /// Writes `bytes` to `path` under its lock: temp file, fsync, rename.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on any filesystem failure.
    pub async fn lock_write(&self, path: &Path, bytes: &[u8], meta: Option<FileMeta>) -> Result<()> {
        let guard = self.acquire(path).await?;
        let out = self.write_replace(path, bytes, meta).await;
        guard.release().await;
        out
    }

    /// Reads, transforms and conditionally rewrites `path` under one lock.
    ///
    /// The transform receives the current bytes (empty when the file does
    /// not exist yet) and returns the replacement, or `None` to leave the
    /// file untouched. A transient error from the transform (a parse
    /// failure of a file that did exist) releases the lock, waits one
    /// retry interval and tries again, up to the data-retry budget.
    ///
    /// Returns whether a write happened.
    ///
    /// # Errors
    ///
    /// [`Error::Corrupt`] when the retry budget runs out; any error the
    /// transform surfaces; [`Error::Io`] on filesystem failures.
    pub async fn lock_update<F>(
        &self,
        path: &Path,
        mut transform: F,
        meta: Option<FileMeta>,
    ) -> Result<bool>
    where
        F: FnMut(&[u8]) -> Result<Option<Vec<u8>>>,
    {
        let mut attempt = 0;
        loop {
            let guard = self.acquire(path).await?;
            let current = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => {
                    guard.release().await;
                    return Err(Error::io(path, e));
                }
            };

            match transform(&current) {
                Ok(Some(next)) if next != current => {
                    let out = self.write_replace(path, &next, meta).await;
                    guard.release().await;
                    return out.map(|()| true);
                }
                Ok(_) => {
                    guard.release().await;
                    return Ok(false);
                }
                Err(e) if e.is_transient() && attempt + 1 < DATA_RETRY_MAX => {
                    guard.release().await;
                    attempt += 1;
                    tokio::time::sleep(DATA_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    guard.release().await;
                    if e.is_transient() {
                        return Err(Error::Corrupt {
                            path: path.display().to_string(),
                            attempts: attempt + 1,
                        });
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Recursively removes `path`, honoring its lock. Absent paths are fine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on a filesystem failure.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        let guard = self.acquire(path).await?;
        let out = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| Error::io(path, e)),
            Ok(_) => tokio::fs::remove_file(path)
                .await
                .map_err(|e| Error::io(path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(path, e)),
        };
        guard.release().await;
        out
    }

    /// Creates `path` and any missing ancestors, applying directory
    /// metadata to each component this call creates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on a filesystem failure.
    pub async fn create_directory(&self, path: &Path, meta: Option<FileMeta>) -> Result<()> {
        let meta = meta.unwrap_or(self.dir_meta);
        let mut stack = Vec::new();
        let mut cursor = path;
        while !cursor.as_os_str().is_empty() && !cursor.exists() {
            stack.push(cursor.to_path_buf());
            match cursor.parent() {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        for dir in stack.into_iter().rev() {
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => meta.apply(&dir).await,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::io(&dir, e)),
            }
        }
        Ok(())
    }

    /// Temp-write, fsync and rename into place. Callers hold the lock.
    async fn write_replace(&self, path: &Path, bytes: &[u8], meta: Option<FileMeta>) -> Result<()> {
        let meta = meta.unwrap_or(self.file_meta);
        let tmp = tmp_path_for(path);

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Error::io(&tmp, e))?;
        file.write_all(bytes).await.map_err(|e| Error::io(&tmp, e))?;
        file.sync_all().await.map_err(|e| Error::io(&tmp, e))?;
        drop(file);

        meta.apply(&tmp).await;

        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            // A failed rename leaves the temp file behind; clean it up.
            let _ = std::fs::remove_file(&tmp);
            Error::io(path, e)
        })
    }
}

/// Sidecar lock path: `P.lock`.
fn lock_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

/// Temp file path: `P.tmp.<pid>`.
fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".tmp.{}", std::process::id()));
    PathBuf::from(os)
}

/// Whether a lock file is older than the stale threshold.
async fn lock_is_stale(lock_path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(lock_path).await else {
        // Vanished between the collision and this check; treat as free.
        return true;
    };
    meta.modified()
        .ok()
        .and_then(|m| m.elapsed().ok())
        .is_some_and(|age| age > LOCK_STALE)
}

/// Runs `op` until it succeeds, retrying transient failures up to `max`
/// attempts with `delay` between them.
///
/// # Errors
///
/// The final error once attempts are exhausted, with the attempt count
/// folded into [`Error::Corrupt`]; non-transient errors pass through at once.
pub async fn retry<T, F, Fut>(max: u32, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < max => {
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(Error::Corrupt { path, .. }) => {
                return Err(Error::Corrupt {
                    path,
                    attempts: attempt + 1,
                });
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests use unwrap for brevity")]
mod tests {
    use super::*;

    fn filer() -> Filer {
        Filer::new(Uuid::new_v4(), FileMeta::default(), FileMeta::default())
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value.json");
        let f = filer();

        f.lock_write(&path, b"{\"a\":1}", None).await.unwrap();
        let bytes = f.lock_read(&path).await.unwrap();
        assert_eq!(bytes, b"{\"a\":1}");

        // No lock or temp residue.
        assert!(!lock_path_for(&path).exists());
        assert!(!tmp_path_for(&path).exists());
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let f = filer();
        let err = f.lock_read(&dir.path().join("absent")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn update_skips_write_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value.json");
        let f = filer();
        f.lock_write(&path, b"stable", None).await.unwrap();

        let wrote = f
            .lock_update(&path, |cur| Ok(Some(cur.to_vec())), None)
            .await
            .unwrap();
        assert!(!wrote);

        let wrote = f
            .lock_update(&path, |_| Ok(Some(b"changed".to_vec())), None)
            .await
            .unwrap();
        assert!(wrote);
        assert_eq!(f.lock_read(&path).await.unwrap(), b"changed");
    }

    #[tokio::test]
    async fn update_sees_empty_bytes_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.json");
        let f = filer();

        let wrote = f
            .lock_update(
                &path,
                |cur| {
                    assert!(cur.is_empty());
                    Ok(Some(b"init".to_vec()))
                },
                None,
            )
            .await
            .unwrap();
        assert!(wrote);
    }

    #[tokio::test]
    async fn contended_lock_blocks_second_acquirer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.json");
        let f = filer();

        let guard = f.acquire(&path).await.unwrap();
        // A second acquire must not get through while the guard is held;
        // give it a deadline well under the full backoff schedule.
        let second = tokio::time::timeout(Duration::from_millis(350), f.acquire(&path)).await;
        assert!(second.is_err(), "second acquire should still be backing off");
        guard.release().await;

        let third = f.acquire(&path).await.unwrap();
        third.release().await;
    }

    #[tokio::test]
    async fn stale_lock_is_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orphaned.json");
        let lock = lock_path_for(&path);
        std::fs::write(&lock, b"{}").unwrap();

        // Age the lock file past the stale threshold.
        let old = std::time::SystemTime::now() - (LOCK_STALE + Duration::from_secs(5));
        let file = std::fs::File::options().write(true).open(&lock).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        let f = filer();
        let guard = f.acquire(&path).await.unwrap();
        guard.release().await;
    }

    #[tokio::test]
    async fn retry_surfaces_attempt_count() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let counter = &calls;
        let err = retry(3, Duration::from_millis(1), || async move {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err::<(), Error>(Error::Corrupt {
                path: "x".to_string(),
                attempts: 1,
            })
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(matches!(err, Error::Corrupt { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn retry_does_not_touch_hard_errors() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let counter = &calls;
        let err = retry(5, Duration::from_millis(1), || async move {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err::<(), Error>(Error::NotFound("x".to_string()))
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn remove_is_recursive_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("a/b/c");
        let f = filer();
        f.create_directory(&tree, None).await.unwrap();
        std::fs::write(tree.join("leaf"), b"x").unwrap();

        let target = dir.path().join("a");
        f.remove(&target).await.unwrap();
        assert!(!target.exists());
        f.remove(&target).await.unwrap();
    }
}
