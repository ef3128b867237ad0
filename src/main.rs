/*
 * Copyright (C) 2026 bhdir contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! The bhdir daemon binary.
//!
//! Constructs the components in dependency order (filer, cacher, index and
//! mounts first, then the directory service, then the observers and the
//! control socket) and runs until a termination signal arrives.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use bhdir::cacher::{Cacher, DEFAULT_TTL};
use bhdir::config::Config;
use bhdir::daemon::Daemon;
use bhdir::directory::Directory;
use bhdir::error::Error;
use bhdir::events::NotifyHub;
use bhdir::filer::Filer;
use bhdir::index::{INDEX_FILE, Index};
use bhdir::path::{Mounts, ROOT_FOLDER};
use bhdir::state::State;
use bhdir::synclog::{self, SyncLogTail};
use bhdir::watcher::Watcher;

/// Exit code asking the service supervisor to restart the daemon, used
/// when another session's folder upgrade forces a back-off.
const RESTART_EXIT_CODE: i32 = 75;

/// Command-line arguments for the bhdir daemon.
#[derive(Parser, Debug)]
#[command(name = "bhdird")]
#[command(version = env!("BHDIR_VERSION"))]
#[command(about = "Distributed hierarchical key-value directory daemon")]
struct Args {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the configuration file (default: /etc/bhdir/bhdir.conf).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Instance name; selects the control socket file.
    #[arg(long, global = true, default_value = "bhdir")]
    instance: String,

    /// Override the configured data root.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Override the control socket path.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
}

/// Subcommands supported by the daemon binary.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default if no subcommand given).
    Serve,
}

/// Entry point.
///
/// # Errors
///
/// Returns an error when startup fails; a foreign folder upgrade exits
/// with [`RESTART_EXIT_CODE`] instead so the supervisor retries.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        None | Some(Command::Serve) => run_server(args).await,
    }
}

/// Runs the daemon.
#[allow(
    clippy::too_many_lines,
    reason = "Server setup requires sequential initialization steps"
)]
async fn run_server(args: Args) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bhdir=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref(), &args.instance)?;
    if let Some(root) = args.root {
        config.root = root;
    }
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    let session_id = Uuid::new_v4();
    info!("starting bhdir {}", env!("BHDIR_VERSION"));
    info!("session id: {session_id}");
    info!("data root: {}", config.root.display());

    // Leaves first: filer, cacher, mounts, hub, index.
    let filer = Arc::new(Filer::new(session_id, config.dir_meta, config.file_meta));
    filer.create_directory(&config.root, None).await?;

    let cacher = Arc::new(match &config.redis {
        Some(dsn) => {
            info!("shared cache at {dsn}");
            Cacher::connect(DEFAULT_TTL, &config.instance, dsn).await?
        }
        None => Cacher::new(DEFAULT_TTL, &config.instance),
    });

    let mounts = Arc::new(Mounts::new(config.root.clone()));
    let hub = Arc::new(NotifyHub::new());
    let index = Arc::new(Index::new(
        Arc::clone(&filer),
        config.root.join(ROOT_FOLDER).join(INDEX_FILE),
    ));

    let directory = match Directory::open(
        Arc::clone(&filer),
        Arc::clone(&cacher),
        Arc::clone(&index),
        Arc::clone(&hub),
        Arc::clone(&mounts),
        session_id,
    )
    .await
    {
        Ok(directory) => Arc::new(directory),
        Err(Error::Upgrade { folder, session }) => {
            error!("folder {folder} is being upgraded by session {session}; restarting");
            std::process::exit(RESTART_EXIT_CODE);
        }
        Err(e) => return Err(e.into()),
    };

    // Load the persistent index; rebuild from a full scan when it is
    // missing or fails its checksum.
    match index.load().await {
        Ok(entries) => info!("index loaded with {entries} entries"),
        Err(e) => {
            warn!("index unavailable ({e}), rebuilding");
            let entries = index.build(&mounts).await?;
            index.save().await?;
            info!("index rebuilt with {entries} entries");
        }
    }
    let save_timer = index.spawn_save_timer();

    let (_watcher, watcher_handle) = Watcher::start(
        Arc::clone(&filer),
        Arc::clone(&cacher),
        Arc::clone(&hub),
        Arc::clone(&mounts),
    )?;

    let state = Arc::new(State::new(
        Arc::clone(&filer),
        mounts.state_dir(),
        session_id,
    ));
    state.write_heartbeat().await?;
    let state_handle = Arc::clone(&state).spawn();

    let synclog_handle = match &config.sync_log {
        Some(log_file) => {
            synclog::platform_supported()?;
            let tail = Arc::new(SyncLogTail::new(
                log_file.clone(),
                Arc::clone(&cacher),
                Arc::clone(&mounts),
            ));
            info!("tailing sync log {}", tail.log_file().display());
            Some(tail.spawn())
        }
        None => None,
    };

    let mut daemon_handle = Daemon::start(
        Arc::clone(&directory),
        config.socket_path.clone(),
        config.socket_meta,
    )
    .await?;

    // Run until the listener dies or a termination signal arrives.
    tokio::select! {
        res = &mut daemon_handle => {
            warn!("control socket task ended: {res:?}");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    daemon_handle.abort();
    watcher_handle.abort();
    state_handle.abort();
    save_timer.abort();
    if let Some(handle) = synclog_handle {
        handle.abort();
    }

    // Persist whatever the index accumulated since the last timer tick.
    if let Err(e) = index.save().await {
        warn!("final index save failed: {e}");
    }
    let _ = tokio::fs::remove_file(&config.socket_path).await;

    info!("bhdir stopped");
    Ok(())
}
