// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 bhdir contributors

//! Process-local read cache with TTL and first-class negative entries.
//!
//! Three states matter per path: *present* (a record), *negative* (the path
//! is definitively absent on disk) and *uncached*. Negative entries let a
//! repeated `get` of a missing variable answer without touching the shared
//! filesystem. An optional Redis backend shares entries between processes
//! on the same node; every Redis failure degrades to local-only operation
//! rather than surfacing to callers.

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::record::Variable;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct Entry {
    /// `Some` = present record, `None` = negative entry.
    slot: Option<Variable>,
    inserted: Instant,
}

/// The in-process cache, optionally backed by Redis.
pub struct Cacher {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    redis: Option<ConnectionManager>,
    prefix: String,
}

impl Cacher {
    /// Creates a local-only cache.
    #[must_use]
    pub fn new(ttl: Duration, instance: &str) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            redis: None,
            prefix: format!("bhdir:{instance}:"),
        }
    }

    /// Creates a cache backed by the Redis instance at `dsn`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the DSN is malformed or the initial
    /// connection fails; a misconfigured shared cache should be loud.
    pub async fn connect(ttl: Duration, instance: &str, dsn: &str) -> Result<Self> {
        let client = redis::Client::open(dsn).map_err(|e| Error::Io {
            path: dsn.to_string(),
            source: std::io::Error::other(e),
        })?;
        let manager = ConnectionManager::new(client).await.map_err(|e| Error::Io {
            path: dsn.to_string(),
            source: std::io::Error::other(e),
        })?;
        let mut cacher = Self::new(ttl, instance);
        cacher.redis = Some(manager);
        Ok(cacher)
    }

    /// Looks up `path`. `None` = uncached; `Some(None)` = negative entry;
    /// `Some(Some(record))` = present.
    pub async fn get(&self, path: &str) -> Option<Option<Variable>> {
        {
            let mut entries = self.entries.lock().await;
            match entries.get(path) {
                Some(entry) if entry.inserted.elapsed() < self.ttl => {
                    return Some(entry.slot.clone());
                }
                Some(_) => {
                    entries.remove(path);
                }
                None => {}
            }
        }

        let slot = self.redis_get(path).await?;
        self.store_local(path, slot.clone()).await;
        Some(slot)
    }

    /// Caches a record (`Some`) or a negative entry (`None`) for `path`.
    pub async fn set(&self, path: &str, slot: Option<Variable>) {
        self.store_local(path, slot.clone()).await;
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let key = self.key(path);
            let payload = serde_json::to_string(&slot).unwrap_or_else(|_| "null".to_string());
            let ttl = self.ttl.as_secs();
            if let Err(e) = conn.set_ex::<_, _, ()>(&key, payload, ttl).await {
                warn!("redis set {key} failed: {e}");
            }
        }
    }

    /// Forgets `path`.
    pub async fn unset(&self, path: &str) {
        self.entries.lock().await.remove(path);
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let key = self.key(path);
            if let Err(e) = conn.del::<_, ()>(&key).await {
                warn!("redis del {key} failed: {e}");
            }
        }
    }

    /// Forgets every path under `prefix` (a directory invalidation).
    /// Local-only; the shared backend ages out via TTL.
    pub async fn unset_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock().await;
        entries.retain(|path, _| !path.starts_with(prefix));
        if self.redis.is_some() {
            debug!("prefix invalidation of {prefix} left to redis TTL");
        }
    }

    /// Drops everything; with Redis, flushes the whole database.
    pub async fn flush(&self) {
        self.entries.lock().await.clear();
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            if let Err(e) = redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await {
                warn!("redis flushdb failed: {e}");
            }
        }
    }

    async fn store_local(&self, path: &str, slot: Option<Variable>) {
        self.entries.lock().await.insert(
            path.to_string(),
            Entry {
                slot,
                inserted: Instant::now(),
            },
        );
    }

    async fn redis_get(&self, path: &str) -> Option<Option<Variable>> {
        let redis = self.redis.as_ref()?;
        let mut conn = redis.clone();
        let key = self.key(path);
        match conn.get::<_, Option<String>>(&key).await {
            Ok(Some(payload)) => serde_json::from_str::<Option<Variable>>(&payload).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("redis get {key} failed: {e}");
                None
            }
        }
    }

    fn key(&self, path: &str) -> String {
        format!("{}{path}", self.prefix)
    }
}

impl std::fmt::Debug for Cacher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cacher")
            .field("ttl", &self.ttl)
            .field("shared", &self.redis.is_some())
            .finish_non_exhaustive()
    }
}
