//! skeind - the Skein event store server

use anyhow::{Context, Result};
use clap::Parser;
use skein_server::{api, Config};
use skein_store::{EnvOptions, Store};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "skeind", about = "Skein behavioral event store server")]
struct Args {
    /// Path to a config file (key = value lines)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the data directory
    #[arg(short, long)]
    data_path: Option<PathBuf>,

    /// Shard count for a fresh store (0 = reuse on-disk layout)
    #[arg(long)]
    shard_count: Option<usize>,

    /// Disable fsync on commit
    #[arg(long)]
    nosync: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("loading config")?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_path) = args.data_path {
        config.data_path = data_path;
    }
    if let Some(shard_count) = args.shard_count {
        config.shard_count = shard_count;
    }
    if args.nosync {
        config.nosync = true;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    write_pid_file(&config)?;

    let opts = EnvOptions {
        nosync: config.nosync,
        max_dbs: config.max_dbs,
        max_readers: config.max_readers,
    };
    let mut store = Store::new(opts);
    store
        .open(&config.data_path, config.shard_count)
        .with_context(|| format!("opening store at {}", config.data_path.display()))?;
    info!(
        data_path = %config.data_path.display(),
        shards = store.shard_count(),
        "store ready"
    );

    let state = api::shared_state(Arc::new(store));
    let routes = api::routes(state);

    let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(
        ([0, 0, 0, 0], config.port),
        async {
            tokio::signal::ctrl_c().await.ok();
        },
    );
    info!(%addr, "listening");
    server.await;

    info!("shutting down");
    let _ = std::fs::remove_file(&config.pid_path);
    Ok(())
}

fn write_pid_file(config: &Config) -> Result<()> {
    if let Some(parent) = config.pid_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            // no pid directory on this host
            return Ok(());
        }
    }
    std::fs::write(&config.pid_path, std::process::id().to_string())
        .with_context(|| format!("writing pid file {}", config.pid_path.display()))
}
