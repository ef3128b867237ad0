#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end tests for the directory service over a real temp root.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use uuid::Uuid;

use bhdir::cacher::{Cacher, DEFAULT_TTL};
use bhdir::directory::Directory;
use bhdir::error::Error;
use bhdir::events::NotifyHub;
use bhdir::filer::{FileMeta, Filer};
use bhdir::index::{INDEX_FILE, Index};
use bhdir::path::{Mounts, ROOT_FOLDER};

struct Harness {
    _root: tempfile::TempDir,
    dir: Arc<Directory>,
    mounts: Arc<Mounts>,
    filer: Arc<Filer>,
    index: Arc<Index>,
    session_id: Uuid,
}

async fn setup() -> Result<Harness> {
    let root = tempfile::tempdir().context("temp root")?;
    let session_id = Uuid::new_v4();
    let filer = Arc::new(Filer::new(
        session_id,
        FileMeta::default(),
        FileMeta::default(),
    ));
    let cacher = Arc::new(Cacher::new(DEFAULT_TTL, "test"));
    let mounts = Arc::new(Mounts::new(root.path().to_path_buf()));
    let hub = Arc::new(NotifyHub::new());
    let index = Arc::new(Index::new(
        Arc::clone(&filer),
        root.path().join(ROOT_FOLDER).join(INDEX_FILE),
    ));

    let dir = Directory::open(
        Arc::clone(&filer),
        cacher,
        Arc::clone(&index),
        Arc::clone(&hub),
        Arc::clone(&mounts),
        session_id,
    )
    .await
    .context("open directory")?;

    Ok(Harness {
        _root: root,
        dir: Arc::new(dir),
        mounts,
        filer,
        index,
        session_id,
    })
}

/// Extracts the error from a result that must have failed.
fn expect_err<T: std::fmt::Debug>(result: std::result::Result<T, Error>) -> Result<Error> {
    match result {
        Err(e) => Ok(e),
        Ok(v) => anyhow::bail!("expected an error, got {v:?}"),
    }
}

fn history_files(entry_dir: &std::path::Path) -> Vec<String> {
    let mut found = Vec::new();
    let mut stack = vec![entry_dir.join(".history")];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && name.ends_with(".json")
            {
                found.push(name.to_string());
            }
        }
    }
    found.sort();
    found
}

#[tokio::test]
async fn set_then_get_returns_full_record() -> Result<()> {
    let h = setup().await?;

    let history = h.dir.set("/cfg/host", None, Some(json!("alpha"))).await?;
    assert!(history.is_some(), "first write must produce history");

    let record = h
        .dir
        .get("/cfg/host", true)
        .await?
        .context("record missing")?;
    assert_eq!(record.value, json!("alpha"));
    assert!(record.ctime <= record.mtime);
    assert!(!record.id.is_nil());

    // The bucket file carries exactly that record under the leaf name.
    let bucket_path = h
        .mounts
        .root()
        .join(ROOT_FOLDER)
        .join("cfg")
        .join(".vars.json");
    let text = std::fs::read_to_string(&bucket_path).context("bucket file")?;
    assert!(text.ends_with('\n'), "bucket keeps its trailing newline");
    let parsed: Value = serde_json::from_str(&text)?;
    assert_eq!(parsed["host"]["value"], json!("alpha"));
    assert_eq!(parsed["host"]["id"], json!(record.id.to_string()));

    // History 0001 exists.
    let entry_dir = h.mounts.root().join(ROOT_FOLDER).join("cfg").join("host");
    assert_eq!(history_files(&entry_dir), vec!["0001.json".to_string()]);
    Ok(())
}

#[tokio::test]
async fn second_write_appends_history_and_keeps_identity() -> Result<()> {
    let h = setup().await?;

    h.dir.set("/cfg/host", None, Some(json!("alpha"))).await?;
    let first = h
        .dir
        .get("/cfg/host", false)
        .await?
        .context("first read")?;

    h.dir.set("/cfg/host", None, Some(json!("beta"))).await?;
    let second = h
        .dir
        .get("/cfg/host", false)
        .await?
        .context("second read")?;

    assert_eq!(second.value, json!("beta"));
    assert_eq!(second.id, first.id, "id is immutable once assigned");
    assert_eq!(second.ctime, first.ctime, "ctime never moves");
    assert!(second.mtime >= first.mtime);

    let entry_dir = h.mounts.root().join(ROOT_FOLDER).join("cfg").join("host");
    let files = history_files(&entry_dir);
    assert_eq!(files.len(), 2);
    assert!(files.contains(&"0001.json".to_string()));
    Ok(())
}

#[tokio::test]
async fn rewriting_equal_value_is_a_no_op() -> Result<()> {
    let h = setup().await?;

    h.dir
        .set("/cfg/host", None, Some(json!({"a": 1, "b": [2, 3]})))
        .await?;
    let before = h.dir.get("/cfg/host", false).await?.context("read")?;

    let outcome = h
        .dir
        .set("/cfg/host", None, Some(json!({"a": 1, "b": [2, 3]})))
        .await?;
    assert_eq!(outcome, None, "equal value must skip the write");

    let after = h.dir.get("/cfg/host", false).await?.context("read")?;
    assert_eq!(after.mtime, before.mtime, "no-op leaves mtime untouched");

    let entry_dir = h.mounts.root().join(ROOT_FOLDER).join("cfg").join("host");
    assert_eq!(history_files(&entry_dir).len(), 1);
    Ok(())
}

#[tokio::test]
async fn attributes_round_trip_and_protect_identity() -> Result<()> {
    let h = setup().await?;
    h.dir.set("/cfg/host", None, Some(json!("alpha"))).await?;
    let original = h.dir.get("/cfg/host", false).await?.context("read")?;

    h.dir.set_attr("/cfg/host", "role", json!("admin")).await?;
    assert_eq!(
        h.dir.get_attr("/cfg/host", "role").await?,
        Some(json!("admin"))
    );

    // Protected attributes stay readable.
    assert_eq!(
        h.dir.get_attr("/cfg/host", "id").await?,
        Some(json!(original.id.to_string()))
    );

    // But never writable or deletable.
    let err = expect_err(h.dir.set_attr("/cfg/host", "id", json!("X")).await)?;
    assert!(matches!(err, Error::ProtectedAttr(_)));
    assert_eq!(err.to_string(), "Protected attribute");

    let err = expect_err(h.dir.del_attr("/cfg/host", "mtime").await)?;
    assert!(matches!(err, Error::ProtectedAttr(_)));

    // The value survived the attribute traffic.
    let after = h.dir.get("/cfg/host", false).await?.context("read")?;
    assert_eq!(after.value, json!("alpha"));
    assert_eq!(after.id, original.id);

    h.dir.del_attr("/cfg/host", "role").await?;
    assert_eq!(h.dir.get_attr("/cfg/host", "role").await?, None);
    Ok(())
}

#[tokio::test]
async fn attr_operations_on_missing_variable_fail() -> Result<()> {
    let h = setup().await?;
    assert!(matches!(
        h.dir.set_attr("/nope/x", "k", json!(1)).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        h.dir.get_attr("/nope/x", "k").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        h.dir.touch("/nope/x").await,
        Err(Error::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn touch_bumps_mtime_only() -> Result<()> {
    let h = setup().await?;
    h.dir.set("/cfg/host", None, Some(json!("alpha"))).await?;
    let before = h.dir.get("/cfg/host", false).await?.context("read")?;

    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.dir.touch("/cfg/host").await?;
    let after = h.dir.get("/cfg/host", false).await?.context("read")?;

    assert!(after.mtime > before.mtime);
    assert_eq!(after.value, before.value);
    assert_eq!(after.id, before.id);
    Ok(())
}

#[tokio::test]
async fn del_removes_record_and_history() -> Result<()> {
    let h = setup().await?;
    h.dir.set("/cfg/host", None, Some(json!("alpha"))).await?;
    h.dir.set("/cfg/port", None, Some(json!(8080))).await?;

    let entry_dir = h.mounts.root().join(ROOT_FOLDER).join("cfg").join("host");
    assert!(entry_dir.join(".history").exists());

    h.dir.del("/cfg/host").await?;
    assert!(!h.dir.exists("/cfg/host").await?);
    assert!(!entry_dir.join(".history").exists());

    // Siblings survive.
    assert!(h.dir.exists("/cfg/port").await?);

    // Deleting again is a quiet no-op.
    h.dir.del("/cfg/host").await?;
    Ok(())
}

#[tokio::test]
async fn ls_maps_names_to_values() -> Result<()> {
    let h = setup().await?;
    h.dir.set("/cfg/host", None, Some(json!("alpha"))).await?;
    h.dir.set("/cfg/port", None, Some(json!(8080))).await?;

    let listing = h.dir.ls("/cfg").await?;
    assert_eq!(listing.len(), 2);
    assert_eq!(listing.get("host"), Some(&json!("alpha")));
    assert_eq!(listing.get("port"), Some(&json!(8080)));
    Ok(())
}

#[tokio::test]
async fn upload_download_round_trip() -> Result<()> {
    let h = setup().await?;
    let payload = b"\x00binary blob\xffpayload";

    let blob_id = h.dir.upload("/img/logo", payload).await?;
    assert!(!blob_id.is_nil());

    let back = h.dir.download("/img/logo").await?.context("blob missing")?;
    assert_eq!(back, payload);

    assert_eq!(h.dir.download("/img/absent").await?, None);

    // The blob UUID is findable through the index.
    let entry = h.index.search(blob_id).await.context("index entry")?;
    assert_eq!(entry.path, "/img/logo");
    Ok(())
}

#[tokio::test]
async fn wait_times_out_with_cached_value() -> Result<()> {
    let h = setup().await?;
    h.dir.set("/cfg/host", None, Some(json!("alpha"))).await?;

    let started = std::time::Instant::now();
    let outcome = h.dir.wait("/cfg/host", 200).await?;
    assert!(outcome.timed_out);
    assert_eq!(outcome.value, json!("alpha"));
    assert!(started.elapsed() >= Duration::from_millis(200));
    Ok(())
}

#[tokio::test]
async fn wait_is_woken_by_concurrent_set() -> Result<()> {
    let h = setup().await?;
    h.dir.set("/cfg/host", None, Some(json!("alpha"))).await?;

    let waiter = {
        let dir = Arc::clone(&h.dir);
        tokio::spawn(async move { dir.wait("/cfg/host", 5000).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.dir.set("/cfg/host", None, Some(json!("gamma"))).await?;

    let outcome = waiter.await??;
    assert!(!outcome.timed_out);
    assert_eq!(outcome.value, json!("gamma"));
    Ok(())
}

#[tokio::test]
async fn folder_mounts_isolate_namespaces() -> Result<()> {
    let h = setup().await?;

    h.dir.create_folder("media").await?;
    h.dir.set("media:/img/logo", None, Some(json!("m"))).await?;
    h.dir.set("/img/logo", None, Some(json!("d"))).await?;

    let media = h
        .dir
        .get("media:/img/logo", false)
        .await?
        .context("media record")?;
    let data = h.dir.get("/img/logo", false).await?.context("data record")?;
    assert_eq!(media.value, json!("m"));
    assert_eq!(data.value, json!("d"));
    assert_ne!(media.id, data.id);

    // The mount carries its own schema marker.
    let meta: Value = serde_json::from_slice(&std::fs::read(
        h.mounts.root().join("media").join(".bhdir.json"),
    )?)?;
    assert_eq!(meta["directory"]["format"], json!(2));
    assert_eq!(meta["directory"]["upgrading"], json!(false));

    // Creating it twice fails.
    assert!(h.dir.create_folder("media").await.is_err());
    Ok(())
}

#[tokio::test]
async fn add_folder_upgrades_legacy_buckets() -> Result<()> {
    let h = setup().await?;

    // A format-1 folder written by an old daemon: raw values in buckets.
    let legacy = h.mounts.root().join("old");
    std::fs::create_dir_all(legacy.join("cfg"))?;
    std::fs::write(
        legacy.join(".bhdir.json"),
        b"{\"directory\": {\"format\": 1, \"upgrading\": false}}\n",
    )?;
    std::fs::write(
        legacy.join("cfg").join(".vars.json"),
        b"{\"host\": \"alpha\", \"port\": 8080}\n",
    )?;

    h.dir.add_folder("old").await?;

    let host = h
        .dir
        .get("old:/cfg/host", false)
        .await?
        .context("upgraded record")?;
    assert_eq!(host.value, json!("alpha"));
    assert!(!host.id.is_nil());
    assert!(host.ctime <= host.mtime);

    let meta: Value =
        serde_json::from_slice(&std::fs::read(legacy.join(".bhdir.json"))?)?;
    assert_eq!(meta["directory"]["format"], json!(2));
    assert_eq!(meta["directory"]["upgrading"], json!(false));
    Ok(())
}

#[tokio::test]
async fn foreign_upgrade_marker_is_refused() -> Result<()> {
    let h = setup().await?;

    let busy = h.mounts.root().join("busy");
    std::fs::create_dir_all(&busy)?;
    std::fs::write(
        busy.join(".bhdir.json"),
        format!(
            "{{\"directory\": {{\"format\": 2, \"upgrading\": \"{}\"}}}}\n",
            Uuid::new_v4()
        ),
    )?;

    let err = expect_err(h.dir.add_folder("busy").await)?;
    assert!(matches!(err, Error::Upgrade { .. }));

    // Our own marker is not an error (a resumed upgrade).
    let own = h.mounts.root().join("own");
    std::fs::create_dir_all(&own)?;
    std::fs::write(
        own.join(".bhdir.json"),
        format!(
            "{{\"directory\": {{\"format\": 2, \"upgrading\": \"{}\"}}}}\n",
            h.session_id
        ),
    )?;
    h.dir.add_folder("own").await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_sets_leave_a_consistent_bucket() -> Result<()> {
    let h = setup().await?;
    h.dir.set("/cfg/host", None, Some(json!("seed"))).await?;
    let seeded = h.dir.get("/cfg/host", false).await?.context("seed")?;

    let a = {
        let dir = Arc::clone(&h.dir);
        tokio::spawn(async move { dir.set("/cfg/host", None, Some(json!("X"))).await })
    };
    let b = {
        let dir = Arc::clone(&h.dir);
        tokio::spawn(async move { dir.set("/cfg/host", None, Some(json!("Y"))).await })
    };
    a.await??;
    b.await??;

    let bucket_path = h
        .mounts
        .root()
        .join(ROOT_FOLDER)
        .join("cfg")
        .join(".vars.json");
    let parsed: Value = serde_json::from_slice(&std::fs::read(&bucket_path)?)?;
    let value = parsed["host"]["value"].clone();
    assert!(
        value == json!("X") || value == json!("Y"),
        "final value must be one of the writers': {value}"
    );
    assert_eq!(parsed["host"]["id"], json!(seeded.id.to_string()));
    Ok(())
}

#[tokio::test]
async fn index_rebuild_finds_every_record() -> Result<()> {
    let h = setup().await?;

    let mut ids = Vec::new();
    for i in 0..10 {
        h.dir
            .set(&format!("/nodes/n{i}"), None, Some(json!(i)))
            .await?;
        let record = h
            .dir
            .get(&format!("/nodes/n{i}"), false)
            .await?
            .context("record")?;
        ids.push((record.id, format!("/nodes/n{i}")));
    }

    // A fresh index built from the same root rediscovers everything.
    let rebuilt = Index::new(
        Arc::clone(&h.filer),
        h.mounts.root().join(ROOT_FOLDER).join(INDEX_FILE),
    );
    let count = rebuilt.build(&h.mounts).await?;
    assert!(count >= 10);
    for (id, path) in ids {
        let entry = rebuilt.search(id).await.context("entry missing")?;
        assert_eq!(entry.path, path);
    }
    Ok(())
}

#[tokio::test]
async fn path_validation_rules() -> Result<()> {
    assert!(Directory::validate_path("/a/b/c"));
    assert!(Directory::validate_path("media:/x"));
    assert!(!Directory::validate_path("relative/path"));
    assert!(!Directory::validate_path("/trailing/"));
    assert!(!Directory::validate_path("/.hidden"));
    assert!(!Directory::validate_path(""));

    let h = setup().await?;
    assert!(matches!(
        h.dir.set("bogus", None, Some(json!(1))).await,
        Err(Error::InvalidPath(_))
    ));
    Ok(())
}
