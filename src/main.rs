use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use driftsync::config::Config;
use driftsync::discovery::DiscoveryService;
use driftsync::identity::PeerId;
use driftsync::jobs;
use driftsync::listing::{ListingClient, ListingServer};
use driftsync::registry::PeerRegistry;
use driftsync::transfer::{FileClient, FileServer};

#[derive(Parser, Debug)]
#[command(name = "driftsync", about = "Peer-to-peer LAN file synchronization daemon")]
struct Cli {
    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the sync root from the config file.
    #[arg(long)]
    sync_root: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(cli: &Cli, config: &Config) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("creating log directory {}", config.log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "driftsync.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout).boxed())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .boxed(),
        )
        .init();
    Ok(guard)
}

/// Creates the sync root if absent. Failure is a setup error for the
/// listing and transfer roles, not for the process.
fn prepare_sync_root(path: &Path) -> bool {
    match std::fs::create_dir_all(path) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("cannot create sync root {}: {}", path.display(), e);
            false
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref());
    if let Some(sync_root) = &cli.sync_root {
        config.sync_root = sync_root.clone();
    }

    let _log_guard = init_logging(&cli, &config)?;

    // An unusable sync root disables the file-serving roles; discovery
    // still runs so the node stays visible on the network.
    let sync_root_ok = prepare_sync_root(&config.sync_root);

    let own_id = PeerId::generate();
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("unknown"));
    let local_ip = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| String::from("unknown"));
    tracing::info!("driftsync starting as {} on {} ({})", own_id, host, local_ip);
    tracing::info!("mirroring {}", config.sync_root.display());

    let registry = Arc::new(PeerRegistry::new());
    let cancel = CancellationToken::new();
    let (listing_jobs_tx, listing_jobs_rx) = jobs::queue();
    let (download_jobs_tx, download_jobs_rx) = jobs::queue();

    let mut services = tokio::task::JoinSet::new();

    // A service that cannot bind is logged and skipped; the others still
    // run, so a node behind a conflicting port keeps its remaining roles.
    match DiscoveryService::bind(own_id, &config, registry.clone(), listing_jobs_tx.clone()).await {
        Ok(discovery) => {
            services.spawn(discovery.run(cancel.clone()));
        }
        Err(e) => tracing::error!("discovery service unavailable: {}", e),
    }

    if sync_root_ok {
        match ListingServer::bind(&config).await {
            Ok(server) => {
                services.spawn(server.run(cancel.clone()));
            }
            Err(e) => tracing::error!("listing server unavailable: {}", e),
        }

        match FileServer::bind(&config).await {
            Ok(server) => {
                services.spawn(server.run(cancel.clone()));
            }
            Err(e) => tracing::error!("file server unavailable: {}", e),
        }

        let listing_client = ListingClient::new(&config, download_jobs_tx.clone());
        services.spawn(listing_client.run(listing_jobs_rx, cancel.clone()));

        let file_client = FileClient::new(&config);
        services.spawn(file_client.run(download_jobs_rx, cancel.clone()));
    } else {
        // Closing the queues turns discovery's job pushes into no-ops.
        drop(listing_jobs_rx);
        drop(download_jobs_rx);
    }

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");
    cancel.cancel();
    while services.join_next().await.is_some() {}

    registry.log_peers();
    registry.clear();
    tracing::info!("driftsync stopped");
    Ok(())
}
