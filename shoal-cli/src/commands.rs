//! CLI command implementations

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Subcommand;
use shoal_core::config::ShoalConfig;
use shoal_core::torrent::{
    ContentId, DownloadReport, Metainfo, PeerAddress, PeerEngine, TcpTrackerClient, TrackerClient,
    TrackerEndpoint, TrackerServer,
};
use shoal_core::{Result, ShoalError};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a tracker
    Tracker {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to bind to
        #[arg(short, long, default_value = "6969")]
        port: u16,
    },
    /// Run a peer, optionally sharing files
    Peer {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to bind to (0 picks a free port)
        #[arg(short, long, default_value = "0")]
        port: u16,
        /// Tracker to announce shared files to, as HOST:PORT
        #[arg(long)]
        tracker: Option<TrackerEndpoint>,
        /// Files to share
        #[arg(long, requires = "tracker")]
        share: Vec<PathBuf>,
    },
    /// Share a file and keep seeding it
    Share {
        /// File to share
        path: PathBuf,
        /// Tracker as HOST:PORT
        #[arg(long)]
        tracker: TrackerEndpoint,
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to bind to (0 picks a free port)
        #[arg(short, long, default_value = "0")]
        port: u16,
        /// Piece length in bytes
        #[arg(long)]
        piece_length: Option<u32>,
    },
    /// List the swarms a tracker knows
    List {
        /// Tracker as HOST:PORT
        #[arg(long)]
        tracker: TrackerEndpoint,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Download content by id or from a metainfo file
    Download {
        /// Content id as 40 hex characters
        #[arg(long, conflicts_with = "metainfo", required_unless_present = "metainfo")]
        content_id: Option<ContentId>,
        /// Path to a .torrent metainfo file
        #[arg(long)]
        metainfo: Option<PathBuf>,
        /// Tracker as HOST:PORT (defaults to the metainfo's tracker)
        #[arg(long, required_unless_present = "metainfo")]
        tracker: Option<TrackerEndpoint>,
        /// Directory to write the file into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Keep seeding after the download completes
        #[arg(long)]
        seed: bool,
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to bind to (0 picks a free port)
        #[arg(short, long, default_value = "0")]
        port: u16,
    },
    /// Check that a peer answers
    Handshake {
        /// Peer as HOST:PORT
        peer: PeerAddress,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> Result<()> {
    let config = ShoalConfig::from_env();
    match command {
        Commands::Tracker { host, port } => run_tracker(&host, port, config).await,
        Commands::Peer {
            host,
            port,
            tracker,
            share,
        } => run_peer(&host, port, tracker, share, config).await,
        Commands::Share {
            path,
            tracker,
            host,
            port,
            piece_length,
        } => share_file(&path, tracker, &host, port, piece_length, config).await,
        Commands::List { tracker, json } => list_swarms(tracker, json, config).await,
        Commands::Download {
            content_id,
            metainfo,
            tracker,
            output,
            seed,
            host,
            port,
        } => {
            let engine = PeerEngine::start(bind_address(&host, port).await?, config).await?;
            let outcome = download(&engine, content_id, metainfo, tracker, &output).await;
            if outcome.is_ok() && seed {
                println!("Seeding on {} (Ctrl-C to stop)", engine.local_peer());
                tokio::signal::ctrl_c().await?;
            }
            engine.stop_all().await;
            outcome
        }
        Commands::Handshake { peer } => handshake(&peer, config).await,
    }
}

async fn bind_address(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| ShoalError::Configuration {
            reason: format!("cannot resolve bind host '{host}'"),
        })
}

/// Run a tracker until Ctrl-C
///
/// # Errors
/// - `ShoalError::Torrent` - Failed to bind the tracker socket
pub async fn run_tracker(host: &str, port: u16, config: ShoalConfig) -> Result<()> {
    let tracker = TrackerServer::bind(bind_address(host, port).await?, &config)
        .await?
        .spawn();
    println!("Tracker listening on {}", tracker.local_addr());

    tokio::signal::ctrl_c().await?;
    tracker.shutdown().await;
    Ok(())
}

/// Run a peer until Ctrl-C, sharing `paths` first
///
/// # Errors
/// - `ShoalError::Torrent` - Failed to bind or to share a file
pub async fn run_peer(
    host: &str,
    port: u16,
    tracker: Option<TrackerEndpoint>,
    paths: Vec<PathBuf>,
    config: ShoalConfig,
) -> Result<()> {
    let engine = PeerEngine::start(bind_address(host, port).await?, config).await?;
    println!("Peer listening on {}", engine.local_peer());

    if let Some(tracker) = tracker {
        for path in &paths {
            let (_, content_id) = engine.share_file(path, tracker.clone()).await?;
            println!("Sharing {} as {content_id}", path.display());
        }
    }

    tokio::signal::ctrl_c().await?;
    engine.stop_all().await;
    Ok(())
}

/// Share one file and seed it until Ctrl-C
///
/// # Errors
/// - `ShoalError::Torrent` - Missing or empty file, bind failure or tracker rejection
pub async fn share_file(
    path: &Path,
    tracker: TrackerEndpoint,
    host: &str,
    port: u16,
    piece_length: Option<u32>,
    mut config: ShoalConfig,
) -> Result<()> {
    if let Some(piece_length) = piece_length {
        config.download.default_piece_length = piece_length;
    }
    let engine = PeerEngine::start(bind_address(host, port).await?, config).await?;
    let (metainfo, content_id) = engine.share_file(path, tracker).await?;

    println!("Shared {}", path.display());
    println!("  Content id: {content_id}");
    println!(
        "  Size: {} bytes in {} pieces of {} bytes",
        metainfo.total_length,
        metainfo.piece_count(),
        metainfo.piece_length
    );
    println!("  Seeding on {} (Ctrl-C to stop)", engine.local_peer());

    tokio::signal::ctrl_c().await?;
    engine.stop_all().await;
    Ok(())
}

/// Print the swarms a tracker knows about
///
/// # Errors
/// - `ShoalError::Torrent` - Tracker unreachable or rejected the request
pub async fn list_swarms(tracker: TrackerEndpoint, json: bool, config: ShoalConfig) -> Result<()> {
    let swarms = TcpTrackerClient::new(tracker.clone(), &config)
        .list_swarms()
        .await?;

    if json {
        let rendered = serde_json::to_string_pretty(&swarms).map_err(std::io::Error::other)?;
        println!("{rendered}");
        return Ok(());
    }

    if swarms.is_empty() {
        println!("No swarms on {tracker}");
        return Ok(());
    }
    println!("{} swarms on {tracker}:", swarms.len());
    for swarm in swarms {
        println!(
            "  {}  {}  {} bytes  {} peers",
            swarm.content_id,
            swarm.name,
            swarm.total_length,
            swarm.members.len()
        );
    }
    Ok(())
}

async fn download(
    engine: &PeerEngine,
    content_id: Option<ContentId>,
    metainfo_path: Option<PathBuf>,
    tracker: Option<TrackerEndpoint>,
    output: &Path,
) -> Result<()> {
    tokio::fs::create_dir_all(output).await?;

    let report = match (metainfo_path, content_id) {
        (Some(path), _) => {
            let mut metainfo = Metainfo::load(&path).await?;
            if let Some(tracker) = tracker {
                metainfo.tracker = tracker;
            }
            engine.download(metainfo, output).await?
        }
        (None, Some(content_id)) => {
            let tracker = tracker.ok_or_else(|| ShoalError::Configuration {
                reason: "--tracker is required with --content-id".to_string(),
            })?;
            engine.download_by_id(tracker, content_id, output).await?
        }
        (None, None) => {
            return Err(ShoalError::Configuration {
                reason: "either --content-id or --metainfo is required".to_string(),
            });
        }
    };

    print_report(&report);
    Ok(())
}

fn print_report(report: &DownloadReport) {
    println!("Downloaded {}", report.name);
    println!("  Content id: {}", report.content_id);
    println!("  {} bytes in {} pieces", report.bytes, report.pieces);
    println!("  Took {:.2?}", report.elapsed);
    println!("  Saved to {}", report.destination.display());
}

/// Check a peer with a handshake
///
/// # Errors
/// - `ShoalError::Torrent` - Peer unreachable or answered incorrectly
pub async fn handshake(peer: &PeerAddress, config: ShoalConfig) -> Result<()> {
    let engine = PeerEngine::start(SocketAddr::from(([127, 0, 0, 1], 0)), config).await?;
    let answered = engine.handshake(peer).await;
    engine.stop_all().await;

    let elapsed = answered?;
    println!("{peer} answered in {elapsed:.2?}");
    Ok(())
}
