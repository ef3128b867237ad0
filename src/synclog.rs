// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 bhdir contributors

//! Tails the sync engine's own log for freshness hints.
//!
//! The updates journal is the authoritative change feed, but it only tells
//! a node that a write happened somewhere; the engine's log says when the
//! transfer of a concrete file has *finished* locally. Lines announcing a
//! finished transfer of a file under the data root invalidate the matching
//! cache entries so the next read goes to disk. Nothing is notified from
//! here; ordering stays with the journal.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::cacher::Cacher;
use crate::error::{Error, Result};
use crate::path::Mounts;

/// How often the log file is polled for appended lines.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lines announcing a locally completed file transfer.
#[allow(clippy::unwrap_used, reason = "Pattern is a compile-time constant")]
static FINISHED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[Ff]inished (?:downloading|syncing) file "?([^"]+?)"?\s*$"#).unwrap());

/// Checks that this platform has a sync engine build at all.
///
/// # Errors
///
/// Returns [`Error::UnsupportedPlatform`] on targets the engine does not
/// ship for.
pub fn platform_supported() -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    {
        Ok(())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
    {
        Err(Error::UnsupportedPlatform(std::env::consts::OS.to_string()))
    }
}

/// Tail state: read offset plus the unterminated trailing line.
#[derive(Debug, Default)]
pub struct TailState {
    pos: u64,
    carry: String,
}

/// The log tailer.
pub struct SyncLogTail {
    log_file: PathBuf,
    cacher: Arc<Cacher>,
    mounts: Arc<Mounts>,
}

impl SyncLogTail {
    /// Creates a tailer for the engine log at `log_file`.
    #[must_use]
    pub const fn new(log_file: PathBuf, cacher: Arc<Cacher>, mounts: Arc<Mounts>) -> Self {
        Self {
            log_file,
            cacher,
            mounts,
        }
    }

    /// Spawns the poll loop. The log file may not exist yet; the loop
    /// keeps waiting for it.
    #[must_use]
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut state = TailState::default();
            // Start at the current end; history predates this session.
            if let Ok(meta) = tokio::fs::metadata(&self.log_file).await {
                state.pos = meta.len();
            }
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll_once(&mut state).await {
                    debug!("sync log poll: {e}");
                }
            }
        })
    }

    /// One poll: read everything appended since the last offset and apply
    /// each complete line. Truncation (log rotation) restarts from zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the log exists but cannot be read.
    pub async fn poll_once(&self, state: &mut TailState) -> Result<()> {
        let meta = match tokio::fs::metadata(&self.log_file).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io(&self.log_file, e)),
        };

        if meta.len() < state.pos {
            debug!("sync log truncated, restarting tail");
            state.pos = 0;
            state.carry.clear();
        }
        if meta.len() == state.pos {
            return Ok(());
        }

        let mut file = tokio::fs::File::open(&self.log_file)
            .await
            .map_err(|e| Error::io(&self.log_file, e))?;
        file.seek(std::io::SeekFrom::Start(state.pos))
            .await
            .map_err(|e| Error::io(&self.log_file, e))?;
        let mut chunk = String::new();
        file.read_to_string(&mut chunk)
            .await
            .map_err(|e| Error::io(&self.log_file, e))?;
        state.pos = meta.len();

        let combined = format!("{}{chunk}", state.carry);
        state.carry.clear();
        let mut lines: Vec<&str> = combined.split('\n').collect();
        if !combined.ends_with('\n') {
            state.carry = lines.pop().unwrap_or_default().to_string();
        }

        for line in lines {
            self.apply_line(line).await;
        }
        Ok(())
    }

    /// Applies one log line: a finished transfer of a file under an
    /// attached folder invalidates its cache entries.
    pub async fn apply_line(&self, line: &str) {
        let Some(captures) = FINISHED_RE.captures(line) else {
            return;
        };
        let Some(raw) = captures.get(1) else {
            return;
        };

        let fs_path = PathBuf::from(raw.as_str());
        let fs_path = if fs_path.is_absolute() {
            fs_path
        } else {
            self.mounts.root().join(fs_path)
        };

        let Some((canonical, is_bucket)) = self.mounts.namespace_of(&fs_path) else {
            return;
        };

        if is_bucket {
            debug!("sync finished bucket {canonical}, invalidating directory");
            self.cacher.unset_prefix(&format!("{canonical}/")).await;
        } else {
            debug!("sync finished {canonical}, invalidating");
            self.cacher.unset(&canonical).await;
        }
    }

    /// The tailed file, for logging at startup.
    #[must_use]
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }
}

impl std::fmt::Debug for SyncLogTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLogTail")
            .field("log_file", &self.log_file)
            .finish_non_exhaustive()
    }
}
