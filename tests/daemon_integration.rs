#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end tests for the control socket: real Unix sockets, real
//! length-framed JSON traffic against a daemon over a temp root.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{Engine as _, prelude::BASE64_STANDARD};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use uuid::Uuid;

use bhdir::cacher::{Cacher, DEFAULT_TTL};
use bhdir::daemon::{Daemon, frame};
use bhdir::directory::Directory;
use bhdir::events::NotifyHub;
use bhdir::filer::{FileMeta, Filer};
use bhdir::index::{INDEX_FILE, Index};
use bhdir::path::{Mounts, ROOT_FOLDER};

struct Harness {
    _root: tempfile::TempDir,
    socket_path: PathBuf,
    directory: Arc<Directory>,
}

async fn spawn_daemon() -> Result<Harness> {
    let root = tempfile::tempdir().context("temp root")?;
    let session_id = Uuid::new_v4();
    let filer = Arc::new(Filer::new(
        session_id,
        FileMeta::default(),
        FileMeta::default(),
    ));
    let cacher = Arc::new(Cacher::new(DEFAULT_TTL, "test"));
    let mounts = Arc::new(Mounts::new(root.path().join("store")));
    let hub = Arc::new(NotifyHub::new());
    let index = Arc::new(Index::new(
        Arc::clone(&filer),
        root.path().join("store").join(ROOT_FOLDER).join(INDEX_FILE),
    ));
    filer.create_directory(mounts.root(), None).await?;

    let directory = Arc::new(
        Directory::open(filer, cacher, index, hub, mounts, session_id)
            .await
            .context("open directory")?,
    );

    let socket_path = root.path().join("bhdir.sock");
    Daemon::start(Arc::clone(&directory), socket_path.clone(), FileMeta::default())
        .await
        .context("start daemon")?;

    Ok(Harness {
        _root: root,
        socket_path,
        directory,
    })
}

struct Client {
    stream: UnixStream,
}

impl Client {
    async fn connect(harness: &Harness) -> Result<Self> {
        let stream = UnixStream::connect(&harness.socket_path)
            .await
            .context("connect control socket")?;
        Ok(Self { stream })
    }

    async fn send(&mut self, request: &Value) -> Result<()> {
        let payload = serde_json::to_vec(request)?;
        frame::write(&mut self.stream, &payload).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Value> {
        let payload = frame::read(&mut self.stream).await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    async fn call(&mut self, request: Value) -> Result<Value> {
        self.send(&request).await?;
        self.recv().await
    }
}

fn request(id: &str, command: &str, args: Vec<Value>) -> Value {
    json!({"id": id, "command": command, "args": args})
}

#[tokio::test]
async fn set_and_get_over_the_socket() -> Result<()> {
    let harness = spawn_daemon().await?;
    let mut client = Client::connect(&harness).await?;

    let response = client
        .call(request("1", "set", vec![json!("/cfg/host"), json!("alpha")]))
        .await?;
    assert_eq!(response["id"], json!("1"));
    assert_eq!(response["success"], json!(true));
    assert!(response["results"][0].is_string(), "history uuid expected");

    let response = client
        .call(request("2", "get", vec![json!("/cfg/host")]))
        .await?;
    assert_eq!(response["success"], json!(true));
    let record = &response["results"][0];
    assert_eq!(record["value"], json!("alpha"));
    assert!(record["id"].is_string());
    assert!(record["ctime"].as_u64().is_some());
    assert!(record["mtime"].as_u64().is_some());
    Ok(())
}

#[tokio::test]
async fn protected_attribute_reports_failure() -> Result<()> {
    let harness = spawn_daemon().await?;
    let mut client = Client::connect(&harness).await?;

    client
        .call(request("1", "set", vec![json!("/cfg/host"), json!("alpha")]))
        .await?;

    let response = client
        .call(request(
            "2",
            "set-attr",
            vec![json!("/cfg/host"), json!("id"), json!("X")],
        ))
        .await?;
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["message"], json!("Protected attribute"));
    Ok(())
}

#[tokio::test]
async fn attrs_round_trip_over_the_socket() -> Result<()> {
    let harness = spawn_daemon().await?;
    let mut client = Client::connect(&harness).await?;

    client
        .call(request("1", "set", vec![json!("/cfg/host"), json!("alpha")]))
        .await?;
    let response = client
        .call(request(
            "2",
            "set-attr",
            vec![json!("/cfg/host"), json!("role"), json!("admin")],
        ))
        .await?;
    assert_eq!(response["success"], json!(true));

    let response = client
        .call(request(
            "3",
            "get-attr",
            vec![json!("/cfg/host"), json!("role")],
        ))
        .await?;
    assert_eq!(response["results"][0], json!("admin"));

    // Unset attributes answer null, still successfully.
    let response = client
        .call(request(
            "4",
            "get-attr",
            vec![json!("/cfg/host"), json!("missing")],
        ))
        .await?;
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["results"][0], Value::Null);
    Ok(())
}

#[tokio::test]
async fn wait_resolves_when_another_client_writes() -> Result<()> {
    let harness = spawn_daemon().await?;
    let mut writer = Client::connect(&harness).await?;
    writer
        .call(request("1", "set", vec![json!("/cfg/host"), json!("beta")]))
        .await?;

    let mut waiter = Client::connect(&harness).await?;
    waiter
        .send(&request("2", "wait", vec![json!("/cfg/host"), json!(5000)]))
        .await?;

    tokio::time::sleep(Duration::from_millis(150)).await;
    writer
        .call(request("3", "set", vec![json!("/cfg/host"), json!("gamma")]))
        .await?;

    let response = waiter.recv().await?;
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["timeout"], json!(false));
    assert_eq!(response["results"], json!(["gamma"]));
    Ok(())
}

#[tokio::test]
async fn wait_timeout_is_a_distinguished_success() -> Result<()> {
    let harness = spawn_daemon().await?;
    let mut client = Client::connect(&harness).await?;
    client
        .call(request("1", "set", vec![json!("/cfg/host"), json!("alpha")]))
        .await?;

    let response = client
        .call(request("2", "wait", vec![json!("/cfg/host"), json!(150)]))
        .await?;
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["timeout"], json!(true));
    assert_eq!(response["results"], json!(["alpha"]));
    Ok(())
}

#[tokio::test]
async fn application_errors_keep_the_connection_open() -> Result<()> {
    let harness = spawn_daemon().await?;
    let mut client = Client::connect(&harness).await?;

    let response = client
        .call(request("1", "get-attr", vec![json!("/nope/x"), json!("k")]))
        .await?;
    assert_eq!(response["success"], json!(false));

    let response = client
        .call(request("2", "unknown-thing", vec![]))
        .await?;
    assert_eq!(response["success"], json!(false));

    // Same connection still serves real work.
    let response = client
        .call(request("3", "exists", vec![json!("/nope/x")]))
        .await?;
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["results"][0], json!(false));
    Ok(())
}

#[tokio::test]
async fn malformed_payload_closes_only_that_connection() -> Result<()> {
    let harness = spawn_daemon().await?;

    let mut broken = Client::connect(&harness).await?;
    frame::write(&mut broken.stream, b"this is not json").await?;
    assert!(
        broken.recv().await.is_err(),
        "protocol damage must close the connection"
    );

    // A zero-length frame is protocol damage too.
    let mut zero = Client::connect(&harness).await?;
    zero.stream.write_all(&0u32.to_be_bytes()).await?;
    zero.stream.flush().await?;
    assert!(zero.recv().await.is_err());

    // Fresh connections are unaffected.
    let mut fresh = Client::connect(&harness).await?;
    let response = fresh
        .call(request("1", "exists", vec![json!("/cfg/host")]))
        .await?;
    assert_eq!(response["success"], json!(true));
    Ok(())
}

#[tokio::test]
async fn pipelined_requests_answer_in_order() -> Result<()> {
    let harness = spawn_daemon().await?;
    let mut client = Client::connect(&harness).await?;

    client
        .send(&request("a", "set", vec![json!("/cfg/one"), json!(1)]))
        .await?;
    client
        .send(&request("b", "set", vec![json!("/cfg/two"), json!(2)]))
        .await?;
    client.send(&request("c", "ls", vec![json!("/cfg")])).await?;

    assert_eq!(client.recv().await?["id"], json!("a"));
    assert_eq!(client.recv().await?["id"], json!("b"));
    let listing = client.recv().await?;
    assert_eq!(listing["id"], json!("c"));
    assert_eq!(listing["results"][0], json!({"one": 1, "two": 2}));
    Ok(())
}

#[tokio::test]
async fn binary_blobs_survive_the_wire_unchanged() -> Result<()> {
    let harness = spawn_daemon().await?;

    // A payload no UTF-8 coercion would survive.
    let payload: Vec<u8> = (0..=255u8).rev().collect();
    harness.directory.upload("/img/raw", &payload).await?;

    let mut client = Client::connect(&harness).await?;
    let response = client
        .call(request("1", "download", vec![json!("/img/raw")]))
        .await?;
    assert_eq!(response["success"], json!(true));
    let encoded = response["results"][0]
        .as_str()
        .context("download result must be a base64 string")?;
    assert_eq!(BASE64_STANDARD.decode(encoded)?, payload);

    // Absent blobs still answer null.
    let response = client
        .call(request("2", "download", vec![json!("/img/absent")]))
        .await?;
    assert_eq!(response["results"][0], Value::Null);
    Ok(())
}

#[tokio::test]
async fn coordinator_commands_answer_with_failure() -> Result<()> {
    let harness = spawn_daemon().await?;
    let mut client = Client::connect(&harness).await?;

    for command in ["network-create", "network-join", "node-create", "role-remove"] {
        let response = client.call(request("1", command, vec![])).await?;
        assert_eq!(response["success"], json!(false));
        assert_eq!(
            response["message"],
            json!("coordinator is not available on this node")
        );
    }
    Ok(())
}

#[tokio::test]
async fn upload_download_and_folders_over_the_socket() -> Result<()> {
    let harness = spawn_daemon().await?;
    let mut client = Client::connect(&harness).await?;

    let response = client
        .call(request(
            "1",
            "upload",
            vec![json!("/docs/readme"), json!("hello world")],
        ))
        .await?;
    assert_eq!(response["success"], json!(true));
    assert!(response["results"][0].is_string());

    let response = client
        .call(request("2", "download", vec![json!("/docs/readme")]))
        .await?;
    let encoded = response["results"][0]
        .as_str()
        .context("download result must be a base64 string")?;
    assert_eq!(BASE64_STANDARD.decode(encoded)?, b"hello world");

    let response = client
        .call(request("3", "create-folder", vec![json!("media")]))
        .await?;
    assert_eq!(response["success"], json!(true));

    let response = client
        .call(request(
            "4",
            "set",
            vec![json!("media:/img/x"), json!("inside")],
        ))
        .await?;
    assert_eq!(response["success"], json!(true));

    let response = client
        .call(request("5", "clear-cache", vec![]))
        .await?;
    assert_eq!(response["success"], json!(true));

    let response = client
        .call(request("6", "get", vec![json!("media:/img/x")]))
        .await?;
    assert_eq!(response["results"][0]["value"], json!("inside"));
    Ok(())
}
