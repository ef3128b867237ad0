// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 bhdir contributors

//! Session liveness heartbeats.
//!
//! Every daemon writes `<state>/<sessionId>.json` on a fixed cadence so
//! peers can tell a live session (fresh heartbeat) from a dead one (stale
//! file). A faster sweep deletes heartbeats nobody refreshes; the files
//! replicate like everything else, so each node ends up sweeping the same
//! garbage at most once.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::filer::Filer;
use crate::record::{now_secs, to_disk_json};

/// Heartbeat refresh cadence.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(60);

/// Sweep cadence.
pub const CLEAN_INTERVAL: Duration = Duration::from_secs(10);

/// A heartbeat older than this marks a dead session.
pub const EXPIRATION_TIMEOUT: Duration = Duration::from_secs(300);

/// The heartbeat file body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// The session id, also the file's stem.
    pub id: Uuid,
    /// When the session started, UTC seconds.
    pub started: u32,
    /// Last refresh, UTC seconds.
    pub updated: u32,
}

/// Writes this session's heartbeat and sweeps dead ones.
#[derive(Debug)]
pub struct State {
    filer: Arc<Filer>,
    dir: PathBuf,
    session_id: Uuid,
    started: u32,
}

impl State {
    /// Creates the liveness component for `dir` (the shared state
    /// directory).
    #[must_use]
    pub fn new(filer: Arc<Filer>, dir: PathBuf, session_id: Uuid) -> Self {
        Self {
            filer,
            dir,
            session_id,
            started: now_secs(),
        }
    }

    /// Writes or refreshes this session's heartbeat file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the write fails.
    pub async fn write_heartbeat(&self) -> Result<()> {
        let state = SessionState {
            id: self.session_id,
            started: self.started,
            updated: now_secs(),
        };
        let file = self.dir.join(format!("{}.json", self.session_id));
        self.filer
            .lock_write(&file, &to_disk_json(&state)?, None)
            .await
    }

    /// Deletes heartbeat files whose mtime is past the expiry window.
    /// Never touches this session's own file. Returns how many went.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the state directory cannot be listed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let own = format!("{}.json", self.session_id);
        let mut removed = 0;

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::io(&self.dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(&self.dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == own || !name.ends_with(".json") {
                continue;
            }

            let expired = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age > EXPIRATION_TIMEOUT);

            if expired {
                debug!("sweeping dead session {name}");
                self.filer.remove(&entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Spawns the heartbeat and sweep timers.
    #[must_use]
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(UPDATE_INTERVAL);
            let mut sweep = tokio::time::interval(CLEAN_INTERVAL);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        if let Err(e) = self.write_heartbeat().await {
                            warn!("heartbeat write failed: {e}");
                        }
                    }
                    _ = sweep.tick() => {
                        if let Err(e) = self.sweep_expired().await {
                            warn!("session sweep failed: {e}");
                        }
                    }
                }
            }
        })
    }
}
