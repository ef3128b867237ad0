// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 bhdir contributors

//! Typed errors shared by every component.
//!
//! The shared filesystem is written by other nodes at any moment, so a read
//! hitting a half-replicated file is an expected condition, not a bug. The
//! error kinds therefore distinguish *transient* inconsistency (retried by
//! the filer, surfaced as [`Error::Corrupt`] only once retries are exhausted)
//! from real filesystem failures ([`Error::Io`]).

use std::path::Path;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the directory core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Path failed syntactic validation.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Attempt to set or delete `id`, `ctime` or `mtime` via the attribute API.
    #[error("Protected attribute")]
    ProtectedAttr(String),

    /// Variable or file absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A consistent JSON read could not be obtained within the retry budget.
    #[error("inconsistent read of {path} after {attempts} attempts")]
    Corrupt {
        /// File that never produced a parseable read.
        path: String,
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// Underlying filesystem syscall failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// File or directory the operation touched.
        path: String,
        /// The failing syscall error.
        #[source]
        source: std::io::Error,
    },

    /// `wait` reached its deadline without a notification.
    #[error("wait timed out")]
    Timeout,

    /// Malformed control-socket request. Fatal to that connection only.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The folder is being upgraded by another daemon session. The daemon
    /// must stop serving it and restart once the upgrade completes.
    #[error("folder {folder} is being upgraded by session {session}")]
    Upgrade {
        /// Name of the folder carrying the foreign upgrade marker.
        folder: String,
        /// Session id of the upgrading daemon.
        session: String,
    },

    /// A platform-specific external binary is expected but absent.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

impl Error {
    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Maps an I/O error, turning `ENOENT` into [`Error::NotFound`].
    pub fn io_or_not_found(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.display().to_string())
        } else {
            Self::io(path, source)
        }
    }

    /// Whether the condition may clear on its own and is worth retrying.
    ///
    /// Only mid-replication inconsistency qualifies; everything else is
    /// surfaced immediately.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}
