// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 bhdir contributors

//! The local request multiplexer: a Unix domain socket speaking a
//! length-framed JSON command protocol.
//!
//! Each message is `len: u32 big-endian || payload`. Requests name a
//! command and positional arguments; responses echo the request id.
//! Protocol-level damage (bad framing, non-JSON, missing fields) closes
//! the offending connection; application errors answer
//! `{success: false, message}` and keep it open. Connections are served
//! concurrently; requests on one connection are answered in order.

use base64::{Engine as _, prelude::BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::filer::FileMeta;

/// Upper bound on a single frame; anything larger is protocol damage.
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// A control-socket request.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Client-chosen correlation id, echoed back.
    pub id: String,
    /// Command name, e.g. `set` or `get-attr`.
    pub command: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// A control-socket response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    /// The request's correlation id.
    pub id: String,
    /// Whether the command succeeded.
    pub success: bool,
    /// Command results, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Value>>,
    /// Human-readable failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set by `wait`: whether the deadline fired first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<bool>,
}

impl Response {
    fn ok(id: String, results: Vec<Value>) -> Self {
        Self {
            id,
            success: true,
            results: Some(results),
            message: None,
            timeout: None,
        }
    }

    fn fail(id: String, message: String) -> Self {
        Self {
            id,
            success: false,
            results: None,
            message: Some(message),
            timeout: None,
        }
    }
}

/// The control-socket server.
pub struct Daemon {
    directory: Arc<Directory>,
    socket_path: PathBuf,
}

impl Daemon {
    /// Binds the socket, applies its ownership and mode, and spawns the
    /// accept loop. Returns the listener task's handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the socket cannot be bound.
    pub async fn start(
        directory: Arc<Directory>,
        socket_path: PathBuf,
        meta: FileMeta,
    ) -> Result<tokio::task::JoinHandle<()>> {
        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }

        // Remove a stale socket from a previous run.
        let _ = tokio::fs::remove_file(&socket_path).await;

        let listener =
            UnixListener::bind(&socket_path).map_err(|e| Error::io(&socket_path, e))?;
        meta.apply(&socket_path).await;
        info!("control socket listening on {}", socket_path.display());

        let daemon = Arc::new(Self {
            directory,
            socket_path,
        });

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let daemon = Arc::clone(&daemon);
                        tokio::spawn(async move {
                            if let Err(e) = daemon.handle_connection(stream).await {
                                debug!("connection closed: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("accept error: {e}"),
                }
            }
        });

        Ok(handle)
    }

    /// Serves one connection until EOF or a protocol error.
    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        loop {
            let mut len_buf = [0u8; 4];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(Error::io(&self.socket_path, e)),
            }

            let len = u32::from_be_bytes(len_buf);
            if len == 0 || len > MAX_FRAME {
                return Err(Error::Protocol(format!("frame length {len} out of range")));
            }

            let mut payload = vec![0u8; len as usize];
            stream
                .read_exact(&mut payload)
                .await
                .map_err(|e| Error::io(&self.socket_path, e))?;

            let request: Request = serde_json::from_slice(&payload)
                .map_err(|e| Error::Protocol(format!("bad request: {e}")))?;

            debug!("request {} {}", request.id, request.command);
            let response = self.dispatch(request).await;

            let body = serde_json::to_vec(&response)
                .map_err(|e| Error::Protocol(format!("serialize response: {e}")))?;
            let frame_len = u32::try_from(body.len())
                .map_err(|_| Error::Protocol("response too large".to_string()))?;
            stream
                .write_all(&frame_len.to_be_bytes())
                .await
                .map_err(|e| Error::io(&self.socket_path, e))?;
            stream
                .write_all(&body)
                .await
                .map_err(|e| Error::io(&self.socket_path, e))?;
        }
    }

    /// Routes a request to the directory operation of the same name.
    async fn dispatch(&self, request: Request) -> Response {
        let Request { id, command, args } = request;

        // `wait` is special: a fired deadline is a successful response
        // carrying `timeout: true`, not a failure.
        if command == "wait" {
            return match self.run_wait(&args).await {
                Ok((timed_out, value)) => Response {
                    id,
                    success: true,
                    results: Some(vec![value]),
                    message: None,
                    timeout: Some(timed_out),
                },
                Err(message) => Response::fail(id, message),
            };
        }

        match self.execute(&command, &args).await {
            Ok(results) => Response::ok(id, results),
            Err(message) => Response::fail(id, message),
        }
    }

    async fn run_wait(&self, args: &[Value]) -> std::result::Result<(bool, Value), String> {
        let path = arg_str(args, 0, "path")?;
        let timeout_ms = args.get(1).and_then(Value::as_u64).unwrap_or(0);
        let outcome = self
            .directory
            .wait(path, timeout_ms)
            .await
            .map_err(|e| e.to_string())?;
        Ok((outcome.timed_out, outcome.value))
    }

    #[allow(
        clippy::too_many_lines,
        reason = "One arm per control-socket command"
    )]
    async fn execute(&self, command: &str, args: &[Value]) -> std::result::Result<Vec<Value>, String> {
        let dir = &self.directory;
        match command {
            "set" => {
                let path = arg_str(args, 0, "path")?;
                let value = arg_any(args, 1, "value")?.clone();
                let history = dir
                    .set(path, None, Some(value))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(vec![history.map_or(Value::Null, |u| {
                    Value::String(u.to_string())
                })])
            }
            "get" => {
                let path = arg_str(args, 0, "path")?;
                let record = dir.get(path, true).await.map_err(|e| e.to_string())?;
                Ok(vec![
                    record.map_or(Ok(Value::Null), |r| serde_json::to_value(&r))
                        .map_err(|e| e.to_string())?,
                ])
            }
            "del" => {
                let path = arg_str(args, 0, "path")?;
                dir.del(path).await.map_err(|e| e.to_string())?;
                Ok(vec![])
            }
            "ls" => {
                let path = arg_str(args, 0, "path")?;
                let listing = dir.ls(path).await.map_err(|e| e.to_string())?;
                Ok(vec![serde_json::to_value(listing).map_err(|e| e.to_string())?])
            }
            "exists" => {
                let path = arg_str(args, 0, "path")?;
                let exists = dir.exists(path).await.map_err(|e| e.to_string())?;
                Ok(vec![Value::Bool(exists)])
            }
            "set-attr" => {
                let path = arg_str(args, 0, "path")?;
                let name = arg_str(args, 1, "name")?;
                let value = arg_any(args, 2, "value")?.clone();
                let history = dir
                    .set_attr(path, name, value)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(vec![Value::String(history.to_string())])
            }
            "get-attr" => {
                let path = arg_str(args, 0, "path")?;
                let name = arg_str(args, 1, "name")?;
                let value = dir
                    .get_attr(path, name)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(vec![value.unwrap_or(Value::Null)])
            }
            "del-attr" => {
                let path = arg_str(args, 0, "path")?;
                let name = arg_str(args, 1, "name")?;
                let history = dir
                    .del_attr(path, name)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(vec![Value::String(history.to_string())])
            }
            "touch" => {
                let path = arg_str(args, 0, "path")?;
                let history = dir.touch(path).await.map_err(|e| e.to_string())?;
                Ok(vec![Value::String(history.to_string())])
            }
            "upload" => {
                let path = arg_str(args, 0, "path")?;
                let content = arg_str(args, 1, "content")?;
                let blob = dir
                    .upload(path, content.as_bytes())
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(vec![Value::String(blob.to_string())])
            }
            "download" => {
                let path = arg_str(args, 0, "path")?;
                let bytes = dir.download(path).await.map_err(|e| e.to_string())?;
                // Blobs are binary; the JSON wire form carries them base64.
                Ok(vec![
                    bytes.map_or(Value::Null, |b| Value::String(BASE64_STANDARD.encode(b))),
                ])
            }
            "clear-cache" => {
                dir.clear_cache().await;
                Ok(vec![])
            }
            "create-folder" => {
                let name = arg_str(args, 0, "name")?;
                dir.create_folder(name).await.map_err(|e| e.to_string())?;
                Ok(vec![])
            }
            "add-folder" => {
                let name = arg_str(args, 0, "name")?;
                dir.add_folder(name).await.map_err(|e| e.to_string())?;
                Ok(vec![])
            }
            "network-create" | "network-join" | "node-create" | "role-remove" => {
                Err("coordinator is not available on this node".to_string())
            }
            other => Err(format!("unknown command: {other}")),
        }
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("socket", &self.socket_path)
            .finish_non_exhaustive()
    }
}

fn arg_str<'a>(args: &'a [Value], i: usize, name: &str) -> std::result::Result<&'a str, String> {
    args.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing or non-string argument: {name}"))
}

fn arg_any<'a>(args: &'a [Value], i: usize, name: &str) -> std::result::Result<&'a Value, String> {
    args.get(i).ok_or_else(|| format!("missing argument: {name}"))
}

/// Client-side helpers for the framed protocol, shared with the tests.
pub mod frame {
    use super::MAX_FRAME;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Writes one length-framed JSON payload.
    ///
    /// # Errors
    ///
    /// Propagates transport errors; refuses frames over [`MAX_FRAME`].
    pub async fn write<W: AsyncWrite + Unpin>(
        writer: &mut W,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|l| *l <= MAX_FRAME)
            .ok_or_else(|| std::io::Error::other("frame too large"))?;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(payload).await
    }

    /// Reads one length-framed payload.
    ///
    /// # Errors
    ///
    /// Propagates transport errors; refuses frames over [`MAX_FRAME`].
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME {
            return Err(std::io::Error::other("frame too large"));
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        Ok(payload)
    }
}
