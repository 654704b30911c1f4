/// relaypool – main entry point.
///
/// Discovers public upstream proxies, keeps the live ones in an embedded
/// store, and serves as a local HTTP/HTTPS forward proxy that routes every
/// request through a randomly chosen healthy upstream.
use anyhow::Result;
use clap::Parser;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relaypool_core::{
    forward::{ForwardServer, DEFAULT_LISTEN_ADDR},
    maintenance::{self, Scheduler},
    pipeline::{self, DEFAULT_SOURCES},
    select::WeightedPool,
    store::{ProxyStore, STORE_DIR},
    validator::{NetValidator, Validate},
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "relaypool",
    about = "Self-refreshing forwarding proxy over discovered upstreams"
)]
#[command(group(clap::ArgGroup::new("mode").args(["once", "list", "check", "cleanup"])))]
struct Cli {
    /// Run the discovery pipeline once and exit
    #[arg(long)]
    once: bool,

    /// Dump all stored records as pretty JSON and exit
    #[arg(long)]
    list: bool,

    /// Re-check health of all stored records and exit
    #[arg(long)]
    check: bool,

    /// Delete stale, disabled and malformed records, then exit
    #[arg(long)]
    cleanup: bool,

    /// Listen address for the forwarding proxy
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Log verbosity (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(cli.log_level.clone()))
        .init();

    // Failing to open the store is fatal; nothing works without it.
    let store = Arc::new(ProxyStore::open(STORE_DIR)?);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    if cli.list {
        return run_list(&store);
    }
    if cli.check {
        return rt.block_on(run_check(store));
    }
    if cli.cleanup {
        return run_cleanup(&store);
    }
    if cli.once {
        return rt.block_on(run_once(store));
    }

    rt.block_on(run_serve(store, cli.listen))
}

// ---------------------------------------------------------------------------
// One-shot modes
// ---------------------------------------------------------------------------

fn run_list(store: &ProxyStore) -> Result<()> {
    let records = store.list()?;
    let json = serde_json::to_string_pretty(&records)?;
    println!("All upstreams in store:\n{}", json);
    Ok(())
}

async fn run_check(store: Arc<ProxyStore>) -> Result<()> {
    maintenance::check_all(&store, Arc::new(NetValidator)).await?;
    info!("health check completed");
    Ok(())
}

fn run_cleanup(store: &ProxyStore) -> Result<()> {
    let deleted = store.cleanup()?;
    println!("Cleanup completed: deleted {} upstreams", deleted);
    Ok(())
}

async fn run_once(store: Arc<ProxyStore>) -> Result<()> {
    let report = pipeline::gather(store, DEFAULT_SOURCES).await?;
    info!(
        "single run completed, new: {}, updated: {}",
        report.new, report.updated
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Default mode: serve + schedule
// ---------------------------------------------------------------------------

async fn run_serve(store: Arc<ProxyStore>, listen: String) -> Result<()> {
    let pool = Arc::new(RwLock::new(WeightedPool::default()));
    let validator: Arc<dyn Validate> = Arc::new(NetValidator);
    let sources: Vec<String> = DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect();

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&pool),
        sources,
        Arc::clone(&validator),
    );
    scheduler.startup().await;

    match store.list() {
        Ok(records) => {
            info!("store holds {} upstreams after startup", records.len());
            if let Ok(json) = serde_json::to_string_pretty(&records) {
                info!("current pool:\n{}", json);
            }
        }
        Err(e) => error!("failed to list store after startup: {}", e),
    }

    // Binding the listen address must fail the process, so it happens here
    // rather than inside the spawned server task.
    let listener = TcpListener::bind(&listen).await?;
    let server = Arc::new(ForwardServer::new(listen, store, pool));
    tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            error!("forward proxy terminated: {}", e);
        }
    });

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_token.cancel();
        }
    });

    scheduler.run(shutdown).await
}
