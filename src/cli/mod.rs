use anyhow::{bail, Context, Result};
use bittorrent_swarm::torrent::load_torrent_file;
use bittorrent_swarm::{
    start_download, DownloadConfig, Error, FileStorage, Metainfo, Progress, TrackerList,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{self, Duration};
use tracing::warn;

const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "bittorrent-swarm")]
#[command(about = "Download a torrent from its swarm", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a torrent file
    Download {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,

        /// Download directory
        #[arg(short, long, default_value = "./downloads")]
        output: PathBuf,

        /// Port reported to the tracker
        #[arg(short, long, default_value = "6881")]
        port: u16,

        /// Maximum number of simultaneous peer connections
        #[arg(short, long, default_value = "50")]
        max_peers: usize,
    },

    /// Show information about a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Download {
                torrent,
                output,
                port,
                max_peers,
            } => {
                let config = DownloadConfig {
                    listen_port: *port,
                    max_peers: *max_peers,
                    ..DownloadConfig::default()
                };
                download(torrent, output, config).await
            }

            Commands::Info { torrent } => show_torrent_info(torrent).await,
        }
    }
}

async fn load(path: &Path) -> Result<Metainfo> {
    load_torrent_file(path)
        .await
        .with_context(|| format!("Failed to load {}", path.display()))
}

async fn download(torrent: &Path, output: &Path, config: DownloadConfig) -> Result<()> {
    let metainfo = load(torrent).await?;
    let tracker = TrackerList::new(metainfo.trackers.clone(), TRACKER_TIMEOUT)
        .context("Failed to build tracker client")?;
    if tracker.is_empty() {
        bail!("{} lists no supported trackers", torrent.display());
    }

    let storage = FileStorage::from_metainfo(output, &metainfo)
        .await
        .context("Failed to prepare download directory")?;

    println!("Downloading {} into {}", metainfo.name, output.display());

    let handle = start_download(
        Arc::new(metainfo.info.clone()),
        Arc::new(tracker),
        Arc::new(storage),
        config,
    )?;

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping download");
            cancel.cancel();
        }
    });

    let progress = handle.subscribe();
    let mut ticker = time::interval(Duration::from_secs(1));
    let wait = handle.wait();
    tokio::pin!(wait);

    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            _ = ticker.tick() => print_progress(&progress.borrow()),
        }
    };
    print_progress(&progress.borrow());

    match result {
        Ok(()) => {
            println!("Download complete");
            Ok(())
        }
        Err(Error::Cancelled) => {
            println!("Download cancelled");
            Ok(())
        }
        Err(e) => Err(e).context("Download failed"),
    }
}

fn print_progress(progress: &Progress) {
    let percent = if progress.pieces_total == 0 {
        100.0
    } else {
        progress.pieces_complete as f64 * 100.0 / progress.pieces_total as f64
    };

    println!(
        "{:5.1}% {}/{} pieces, {} bytes, {} peers{}",
        percent,
        progress.pieces_complete,
        progress.pieces_total,
        progress.bytes_downloaded,
        progress.peers,
        if progress.stalled { " (stalled)" } else { "" }
    );
}

async fn show_torrent_info(torrent_path: &Path) -> Result<()> {
    let metainfo = load(torrent_path).await?;
    let info = &metainfo.info;

    println!("Torrent Information");
    println!("==================");
    println!("Name: {}", metainfo.name);
    println!("Total Size: {} bytes", info.total_length);
    println!("Piece Length: {} bytes", info.piece_length);
    println!("Number of Pieces: {}", info.piece_count());
    println!("Info Hash: {}", info.info_hash_hex());

    println!("\nTrackers:");
    for tracker in &metainfo.trackers {
        println!("  - {}", tracker);
    }

    println!("\nFiles:");
    for (i, file) in metainfo.files.iter().enumerate() {
        println!(
            "  {}: {} ({} bytes)",
            i + 1,
            file.path.join("/"),
            file.length
        );
    }

    Ok(())
}
