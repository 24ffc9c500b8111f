//! kestreld — the kestrel KvStore daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use kestrel_server::client::NetClientFactory;
use kestrel_server::config::DaemonConfig;
use kestrel_server::server::KvServer;
use kestrel_store::Store;

/// kestrel KvStore daemon
#[derive(Debug, Parser)]
#[command(name = "kestreld", about = "Replicated KvStore daemon", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long, default_value = "kestrel.toml")]
    config: PathBuf,

    /// Override the configured listen address
    #[arg(long)]
    listen: Option<String>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("kestreld: error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_filter)),
        )
        .init();

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config {}", args.config.display()))?;
    let mut cfg: DaemonConfig = toml::from_str(&raw)
        .with_context(|| format!("parsing config {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        cfg.listen_addr = listen;
    }
    cfg.validate().map_err(anyhow::Error::msg)?;

    let factory = Arc::new(NetClientFactory::from_config(&cfg.store));
    let store = Store::spawn(cfg.store.clone(), factory)?;

    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    let server = KvServer::new(Arc::clone(&store));

    info!(
        node = %cfg.store.node_name,
        listen = %cfg.listen_addr,
        areas = cfg.store.areas.len(),
        "kestreld started"
    );

    tokio::select! {
        result = Arc::clone(&server).run(listener) => {
            result.context("rpc listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining");
        }
    }

    store.stop().await;
    info!("kestreld stopped");
    Ok(())
}
