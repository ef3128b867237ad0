// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 bhdir contributors

//! Daemon configuration: defaults, then `bhdir.conf` (INI), then `BHDIR_*`
//! environment overrides. Octal mode strings are parsed and user/group
//! names resolved against the OS databases at load time so the rest of
//! the daemon only ever sees numeric ids.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::filer::FileMeta;

/// Default system-wide configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/bhdir/bhdir.conf";

/// Directory holding control sockets, one per instance.
pub const DEFAULT_SOCKET_DIR: &str = "/var/run/bhdir";

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance name; selects the control socket file.
    pub instance: String,
    /// Data root holding folders, updates and state.
    pub root: PathBuf,
    /// Metadata for directories the daemon creates.
    pub dir_meta: FileMeta,
    /// Metadata for files the daemon creates.
    pub file_meta: FileMeta,
    /// Control socket path.
    pub socket_path: PathBuf,
    /// Ownership and mode applied to the control socket.
    pub socket_meta: FileMeta,
    /// Optional shared cache DSN (`redis://...`).
    pub redis: Option<String>,
    /// Optional sync engine log file to tail.
    pub sync_log: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    directory: RawDirectory,
    #[serde(default)]
    socket: RawSocket,
    #[serde(default)]
    cache: RawCache,
    #[serde(default)]
    resilio: RawResilio,
}

#[derive(Debug, Deserialize)]
struct RawDirectory {
    root: String,
    user: Option<String>,
    group: Option<String>,
    dir_mode: String,
    file_mode: String,
}

#[derive(Debug, Deserialize)]
struct RawSocket {
    path: Option<String>,
    user: Option<String>,
    group: Option<String>,
    mode: String,
}

impl Default for RawSocket {
    fn default() -> Self {
        Self {
            path: None,
            user: None,
            group: None,
            mode: "0600".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawCache {
    redis: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawResilio {
    log_file: Option<String>,
}

impl Config {
    /// Loads configuration for `instance` from standard paths or an
    /// explicit file.
    ///
    /// # Errors
    ///
    /// Returns an error when no `directory.root` is configured, a mode
    /// string is not octal, or a named user/group does not exist.
    pub fn load(explicit_file: Option<&Path>, instance: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("directory.dir_mode", "0755")?
            .set_default("directory.file_mode", "0644")?
            .set_default("socket.mode", "0600")?;

        let default_file = Path::new(DEFAULT_CONFIG_FILE);
        if default_file.exists() {
            builder = builder.add_source(config::File::new(
                DEFAULT_CONFIG_FILE,
                config::FileFormat::Ini,
            ));
        }

        if let Some(path) = explicit_file {
            let path_str = path
                .to_str()
                .ok_or_else(|| anyhow!("config path is not valid UTF-8"))?;
            builder = builder.add_source(config::File::new(path_str, config::FileFormat::Ini));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("BHDIR")
                .separator("__")
                .ignore_empty(true),
        );

        let raw: RawConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration (directory.root is required)")?;

        let uid = raw.directory.user.as_deref().map(resolve_user).transpose()?;
        let gid = raw
            .directory
            .group
            .as_deref()
            .map(resolve_group)
            .transpose()?;

        let dir_meta = FileMeta {
            mode: Some(parse_mode(&raw.directory.dir_mode)?),
            uid,
            gid,
        };
        let file_meta = FileMeta {
            mode: Some(parse_mode(&raw.directory.file_mode)?),
            uid,
            gid,
        };

        let socket_meta = FileMeta {
            mode: Some(parse_mode(&raw.socket.mode)?),
            uid: raw.socket.user.as_deref().map(resolve_user).transpose()?,
            gid: raw.socket.group.as_deref().map(resolve_group).transpose()?,
        };

        let socket_path = raw.socket.path.map_or_else(
            || PathBuf::from(DEFAULT_SOCKET_DIR).join(format!("{instance}.sock")),
            PathBuf::from,
        );

        Ok(Self {
            instance: instance.to_string(),
            root: PathBuf::from(raw.directory.root),
            dir_meta,
            file_meta,
            socket_path,
            socket_meta,
            redis: raw.cache.redis,
            sync_log: raw.resilio.log_file.map(PathBuf::from),
        })
    }
}

/// Parses an octal mode string like `0644`.
fn parse_mode(text: &str) -> Result<u32> {
    let trimmed = text.trim().trim_start_matches("0o");
    u32::from_str_radix(trimmed, 8).with_context(|| format!("invalid octal mode: {text}"))
}

/// Resolves a user name to its uid.
fn resolve_user(name: &str) -> Result<u32> {
    let user = nix::unistd::User::from_name(name)
        .with_context(|| format!("user lookup failed: {name}"))?
        .ok_or_else(|| anyhow!("unknown user: {name}"))?;
    Ok(user.uid.as_raw())
}

/// Resolves a group name to its gid.
fn resolve_group(name: &str) -> Result<u32> {
    let group = nix::unistd::Group::from_name(name)
        .with_context(|| format!("group lookup failed: {name}"))?
        .ok_or_else(|| anyhow!("unknown group: {name}"))?;
    Ok(group.gid.as_raw())
}
