// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 bhdir contributors

//! The on-disk data model: variable records, bucket files, history entries.
//!
//! A bucket file (`.vars.json`) maps leaf names to records. The exact byte
//! form of a rewritten bucket matters: the external sync engine detects
//! changes by content, so serialization always uses 4-space indentation and
//! a trailing newline to keep diffs between nodes minimal.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Per-directory bucket file name.
pub const BUCKET_FILE: &str = ".vars.json";

/// Per-variable history directory name.
pub const HISTORY_DIR: &str = ".history";

/// Attributes owned by the daemon, refused by the attribute API.
pub const PROTECTED_ATTRS: [&str; 3] = ["id", "ctime", "mtime"];

/// Current UTC time as whole seconds since the epoch.
#[must_use]
pub fn now_secs() -> u32 {
    u32::try_from(Utc::now().timestamp()).unwrap_or(u32::MAX)
}

/// A versioned variable: identity, timestamps, value and free attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variable {
    /// Identity, minted on first write and immutable afterwards.
    pub id: Uuid,
    /// Creation time, UTC seconds.
    pub ctime: u32,
    /// Last modification time, UTC seconds. Never before `ctime`.
    pub mtime: u32,
    /// The value payload, any JSON.
    #[serde(default)]
    pub value: Value,
    /// Free-form attributes set via the attribute API.
    #[serde(flatten)]
    pub attrs: serde_json::Map<String, Value>,
}

impl Variable {
    /// Mints a fresh record holding `value`, stamped now.
    #[must_use]
    pub fn new(value: Value) -> Self {
        let now = now_secs();
        Self {
            id: Uuid::new_v4(),
            ctime: now,
            mtime: now,
            value,
            attrs: serde_json::Map::new(),
        }
    }

    /// Whether `name` is one of the protected attributes.
    #[must_use]
    pub fn is_protected(name: &str) -> bool {
        PROTECTED_ATTRS.contains(&name)
    }

    /// Deep JSON equality of values, compared in stringified form so that
    /// objects with equal members in any order count as equal.
    #[must_use]
    pub fn value_equals(&self, other: &Value) -> bool {
        let lhs = serde_json::to_string(&self.value).unwrap_or_default();
        let rhs = serde_json::to_string(other).unwrap_or_default();
        lhs == rhs
    }
}

/// A bucket: leaf name to record, ordered for stable rewrites.
pub type Bucket = BTreeMap<String, Variable>;

/// One history file: the record as it stood after a write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Identity of this history entry itself, not of the variable.
    pub id: Uuid,
    /// The write's modification time, UTC seconds.
    pub mtime: u32,
    /// The post-write record.
    pub variable: Variable,
}

/// Serializes any value the way bucket and metadata files are written:
/// 4-space indent, trailing newline.
///
/// # Errors
///
/// Returns [`Error::Protocol`] when the value cannot be represented as JSON.
pub fn to_disk_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let fmt = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
    value
        .serialize(&mut ser)
        .map_err(|e| Error::Protocol(format!("serialize: {e}")))?;
    buf.push(b'\n');
    Ok(buf)
}

/// Parses bucket bytes. Empty input counts as an empty bucket; anything
/// else must be a JSON object of records.
///
/// # Errors
///
/// Returns a transient [`Error::Corrupt`] when the bytes do not parse; the
/// caller's retry loop decides when to give up.
pub fn parse_bucket(bytes: &[u8], origin: &std::path::Path) -> Result<Bucket> {
    if bytes.is_empty() {
        return Ok(Bucket::new());
    }
    serde_json::from_slice(bytes).map_err(|_| Error::Corrupt {
        path: origin.display().to_string(),
        attempts: 1,
    })
}

/// Folder metadata stored in `.bhdir.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderMeta {
    /// The `directory` block.
    pub directory: FolderDirectory,
}

/// Schema marker of a folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderDirectory {
    /// Schema format. `2` is current; `1` stored raw values.
    pub format: u32,
    /// `false`, or the session id of the daemon performing an upgrade.
    pub upgrading: UpgradeMark,
}

/// The `upgrading` field: a boolean when idle, a session id mid-upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpgradeMark {
    /// No upgrade in progress (always serialized as `false`).
    Idle(bool),
    /// Session id of the upgrading daemon.
    Session(String),
}

impl UpgradeMark {
    /// The idle marker.
    #[must_use]
    pub const fn idle() -> Self {
        Self::Idle(false)
    }

    /// The session currently upgrading, if any.
    #[must_use]
    pub fn session(&self) -> Option<&str> {
        match self {
            Self::Idle(_) => None,
            Self::Session(s) => Some(s),
        }
    }
}

impl FolderMeta {
    /// Fresh metadata for a newly created folder.
    #[must_use]
    pub const fn current() -> Self {
        Self {
            directory: FolderDirectory {
                format: 2,
                upgrading: UpgradeMark::idle(),
            },
        }
    }
}

/// One change announced through the updates drop-directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalVar {
    /// `update` or `delete`.
    pub event: JournalEvent,
    /// Canonical namespace path of the changed variable.
    pub path: String,
    /// The write's modification time, UTC seconds.
    pub mtime: u32,
}

/// Journal event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalEvent {
    /// A variable was written.
    Update,
    /// A variable was removed.
    Delete,
}

/// A journal file dropped into the updates directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalFile {
    /// The changes this write produced.
    pub vars: Vec<JournalVar>,
}

/// Name of the folder metadata file.
pub const FOLDER_META_FILE: &str = ".bhdir.json";

/// Current bucket schema format.
pub const FORMAT_CURRENT: u32 = 2;

/// Legacy schema: buckets store raw values without identity or timestamps.
pub const FORMAT_LEGACY: u32 = 1;
