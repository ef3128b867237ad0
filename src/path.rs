// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 bhdir contributors

//! Namespace path parsing and the mapping of folders to filesystem roots.
//!
//! A variable path looks like `/etc/host` with an optional folder selector
//! prefix, `media:/etc/host`, choosing a non-root mount. Components never
//! start with a dot so the daemon's own bookkeeping files (`.vars.json`,
//! `.history`, `.bhdir.json`, `.index.1`) can never collide with user data.

use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{LazyLock, RwLock};

use crate::error::{Error, Result};

/// Name of the folder selected when a path carries no prefix.
pub const ROOT_FOLDER: &str = "data";

/// Rooted path: no empty segments, no trailing slash, no leading-dot component.
#[allow(clippy::unwrap_used, reason = "Pattern is a compile-time constant")]
static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[^/.][^/]*(/[^/.][^/]*)*$").unwrap());

/// Folder names obey the same syntax as a single path component.
#[allow(clippy::unwrap_used, reason = "Pattern is a compile-time constant")]
static FOLDER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^/.:][^/:]*$").unwrap());

/// Returns whether `path` (without any folder prefix) is syntactically valid.
#[must_use]
pub fn validate(path: &str) -> bool {
    PATH_RE.is_match(path)
}

/// Returns whether `name` is usable as a folder name.
#[must_use]
pub fn validate_folder_name(name: &str) -> bool {
    FOLDER_RE.is_match(name)
}

/// A parsed variable path: the selected folder plus its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirPath {
    /// Folder (mount) the path lives in.
    pub folder: String,
    /// Path components, at least one, none starting with a dot.
    pub parts: Vec<String>,
}

impl DirPath {
    /// Parses `input`, honoring an optional `folder:` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] when the folder name or the rooted
    /// path fails validation.
    pub fn parse(input: &str) -> Result<Self> {
        let (folder, rest) = match input.split_once(':') {
            Some((folder, rest)) if !folder.contains('/') => {
                if !validate_folder_name(folder) {
                    return Err(Error::InvalidPath(input.to_string()));
                }
                (folder.to_string(), rest)
            }
            _ => (ROOT_FOLDER.to_string(), input),
        };

        if !validate(rest) {
            return Err(Error::InvalidPath(input.to_string()));
        }

        let parts = rest
            .split('/')
            .skip(1)
            .map(std::string::ToString::to_string)
            .collect();

        Ok(Self { folder, parts })
    }

    /// The last component, the variable's leaf name.
    #[must_use]
    pub fn leaf(&self) -> &str {
        self.parts.last().map_or("", String::as_str)
    }

    /// All components but the last; the bucket's directory.
    #[must_use]
    pub fn parent_parts(&self) -> &[String] {
        let n = self.parts.len();
        &self.parts[..n.saturating_sub(1)]
    }

    /// The canonical string form: `/a/b` for the root folder,
    /// `media:/a/b` otherwise. This is the cache and notify key.
    #[must_use]
    pub fn canonical(&self) -> String {
        let rooted = format!("/{}", self.parts.join("/"));
        if self.folder == ROOT_FOLDER {
            rooted
        } else {
            format!("{}:{rooted}", self.folder)
        }
    }

    /// The canonical form of a sibling leaf in the same bucket.
    #[must_use]
    pub fn sibling(&self, leaf: &str) -> String {
        let mut parts: Vec<&str> = self.parent_parts().iter().map(String::as_str).collect();
        parts.push(leaf);
        let rooted = format!("/{}", parts.join("/"));
        if self.folder == ROOT_FOLDER {
            rooted
        } else {
            format!("{}:{rooted}", self.folder)
        }
    }
}

impl std::fmt::Display for DirPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// The set of attached folders and where each lives on disk.
///
/// Shared by the directory (which resolves writes) and the watcher (which
/// maps journal entries back to bucket files) without either holding a
/// reference to the other.
#[derive(Debug)]
pub struct Mounts {
    root: PathBuf,
    folders: RwLock<HashMap<String, PathBuf>>,
}

impl Mounts {
    /// Creates the mount table for a data root. No folders are attached yet.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            folders: RwLock::new(HashMap::new()),
        }
    }

    /// The configured data root (`directory.root`).
    #[must_use]
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// The shared updates drop-directory.
    #[must_use]
    pub fn updates_dir(&self) -> PathBuf {
        self.root.join("updates")
    }

    /// The session heartbeat directory.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    /// Registers a folder at its on-disk location.
    pub fn attach(&self, name: &str) {
        let dir = self.root.join(name);
        if let Ok(mut folders) = self.folders.write() {
            folders.insert(name.to_string(), dir);
        }
    }

    /// Resolves a folder name to its directory, if attached.
    #[must_use]
    pub fn folder_dir(&self, name: &str) -> Option<PathBuf> {
        self.folders.read().ok().and_then(|f| f.get(name).cloned())
    }

    /// All attached folders as `(name, directory)` pairs.
    #[must_use]
    pub fn attached(&self) -> Vec<(String, PathBuf)> {
        self.folders.read().map_or_else(
            |_| Vec::new(),
            |f| f.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        )
    }

    /// Whether a folder is attached.
    #[must_use]
    pub fn is_attached(&self, name: &str) -> bool {
        self.folders.read().is_ok_and(|f| f.contains_key(name))
    }

    /// The directory holding a path's bucket file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the folder is not attached.
    pub fn bucket_dir(&self, path: &DirPath) -> Result<PathBuf> {
        let mut dir = self
            .folder_dir(&path.folder)
            .ok_or_else(|| Error::NotFound(format!("folder {}", path.folder)))?;
        for part in path.parent_parts() {
            dir.push(part);
        }
        Ok(dir)
    }

    /// The bucket file (`.vars.json`) holding a path's record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the folder is not attached.
    pub fn bucket_file(&self, path: &DirPath) -> Result<PathBuf> {
        Ok(self.bucket_dir(path)?.join(crate::record::BUCKET_FILE))
    }

    /// The full filesystem path of a variable's own node (blob payloads,
    /// `.history` sibling).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the folder is not attached.
    pub fn entry_path(&self, path: &DirPath) -> Result<PathBuf> {
        Ok(self.bucket_dir(path)?.join(path.leaf()))
    }

    /// Maps an absolute filesystem path back into the namespace.
    ///
    /// Returns `(canonical path, is_bucket)` when the file lies inside an
    /// attached folder. Bucket files map to their directory's rooted path.
    #[must_use]
    pub fn namespace_of(&self, fs_path: &std::path::Path) -> Option<(String, bool)> {
        for (name, dir) in self.attached() {
            let Ok(rel) = fs_path.strip_prefix(&dir) else {
                continue;
            };
            let mut parts: Vec<String> = rel
                .components()
                .filter_map(|c| match c {
                    std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect();

            let is_bucket = parts.last().is_some_and(|l| l == crate::record::BUCKET_FILE);
            if is_bucket {
                parts.pop();
            }
            if parts.is_empty() || parts.iter().any(|p| p.starts_with('.')) {
                continue;
            }

            let rooted = format!("/{}", parts.join("/"));
            let canonical = if name == ROOT_FOLDER {
                rooted
            } else {
                format!("{name}:{rooted}")
            };
            return Some((canonical, is_bucket));
        }
        None
    }
}
