// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 bhdir contributors

//! Per-path notification fan-out backing the blocking `wait` operator.
//!
//! Writers (local mutations and the watcher's remote observations) publish
//! the post-write record, or `None` for a deletion. Waiters race that
//! publication against their deadline.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::record::Variable;

/// Buffered notifications per path channel; waiters that lag simply see
/// the latest value on the next receive.
const CHANNEL_DEPTH: usize = 16;

/// Outcome of a `wait`.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    /// Whether the deadline fired before any notification.
    pub timed_out: bool,
    /// The notified value, or the caller-supplied fallback on timeout.
    pub value: Value,
}

/// Fan-out of per-path change notifications.
#[derive(Debug, Default)]
pub struct NotifyHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Option<Variable>>>>,
}

impl NotifyHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a change of `path` to every registered waiter. Channels
    /// nobody listens on are pruned.
    pub fn notify(&self, path: &str, record: Option<Variable>) {
        let Ok(mut channels) = self.channels.lock() else {
            return;
        };
        if let Some(tx) = channels.get(path) {
            if tx.receiver_count() == 0 {
                channels.remove(path);
            } else {
                let _ = tx.send(record);
            }
        }
    }

    /// Registers a waiter on `path`.
    fn subscribe(&self, path: &str) -> Option<broadcast::Receiver<Option<Variable>>> {
        let mut channels = self.channels.lock().ok()?;
        let tx = channels
            .entry(path.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_DEPTH).0);
        Some(tx.subscribe())
    }

    /// Blocks until `path` is notified or `timeout_ms` elapses. A timeout
    /// of zero waits forever. `fallback` is the value handed back when the
    /// deadline wins (the caller's cached view).
    pub async fn wait(&self, path: &str, timeout_ms: u64, fallback: Value) -> WaitOutcome {
        let Some(mut rx) = self.subscribe(path) else {
            return WaitOutcome {
                timed_out: true,
                value: fallback,
            };
        };

        let recv = async {
            loop {
                match rx.recv().await {
                    Ok(record) => {
                        return record.map_or(Value::Null, |r| r.value);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return Value::Null,
                }
            }
        };

        if timeout_ms == 0 {
            let value = recv.await;
            return WaitOutcome {
                timed_out: false,
                value,
            };
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), recv).await {
            Ok(value) => WaitOutcome {
                timed_out: false,
                value,
            },
            Err(_) => WaitOutcome {
                timed_out: true,
                value: fallback,
            },
        }
    }
}
