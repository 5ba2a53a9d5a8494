use anyhow::{Context, Result};
use clap::Parser;
use rustybt::client::{Client, Config};
use rustybt::torrent::Metainfo;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A small BitTorrent client: announces to trackers, trades pieces over
/// the peer wire, and verifies everything it writes.
#[derive(Parser, Debug)]
#[command(name = "rbt", version)]
struct Cli {
    /// TCP port to listen on for peer connections
    port: u16,
    /// Path to the .torrent file
    torrent: PathBuf,
    /// Directory the payload is written into (created if missing)
    download_dir: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    if !cli.torrent.is_file() {
        anyhow::bail!("torrent file {} does not exist", cli.torrent.display());
    }
    std::fs::create_dir_all(&cli.download_dir)
        .with_context(|| format!("cannot create {}", cli.download_dir.display()))?;

    let meta = Arc::new(
        Metainfo::load(&cli.torrent)
            .with_context(|| format!("cannot load {}", cli.torrent.display()))?,
    );
    info!(
        name = %meta.name,
        info_hash = %hex::encode(meta.info_hash),
        pieces = meta.num_pieces(),
        size = meta.total_length,
        trackers = meta.trackers.len(),
        "torrent loaded"
    );

    let client = Client::new(
        meta,
        Config {
            port: cli.port,
            download_dir: cli.download_dir,
        },
    )?;
    client
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received");
        })
        .await
}
