//! Peerbook broker
//!
//! Presence and trust broker for WebRTC peers.
//!
//! # Usage
//!
//! ```bash
//! # In-memory store, default port
//! peerbook
//!
//! # Persistent store and a config file
//! peerbook --config /etc/peerbook/config.toml --db /var/lib/peerbook/peerbook.db
//!
//! # Print the default configuration
//! peerbook --sample-config
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peerbook_core::{Clock, Config, LogConfig, SystemClock};
use peerbook_signal::{Broker, PeerbookServer, Store};

#[derive(Parser, Debug)]
#[command(name = "peerbook")]
#[command(about = "Presence and trust broker for WebRTC peers")]
#[command(version)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, env = "PEERBOOK_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database path (in-memory if neither this nor the config sets one)
    #[arg(short, long)]
    db: Option<PathBuf>,

    /// Print the default configuration and exit
    #[arg(long)]
    sample_config: bool,
}

fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::builder()
        .with_default_directive(log.level.parse().unwrap_or(Level::INFO.into()))
        .from_env_lossy();

    if log.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.sample_config {
        print!("{}", Config::sample());
        return Ok(());
    }

    let config_path = args.config.clone().or_else(Config::default_path);
    let mut config = Config::resolve(config_path.as_deref()).with_context(|| match &config_path {
        Some(path) => format!("failed to load config from {}", path.display()),
        None => "failed to load config".to_string(),
    })?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(db) = args.db {
        config.store.db_path = Some(db);
    }

    init_logging(&config.log);
    info!("Starting Peerbook");
    match config_path.filter(|p| p.exists()) {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => info!("No config file, using defaults"),
    }

    if let Some(db_path) = &config.store.db_path {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        info!("Using SQLite persistence: {:?}", db_path);
    } else {
        info!("Using in-memory store (no persistence)");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Store::open(&config.store, clock.clone()).context("failed to open the store")?;
    let broker = Arc::new(Broker::new(Arc::new(store), &config, clock));

    // Sessions did not survive the restart
    let reset = broker
        .directory
        .reset_all_online()
        .context("failed to reset online flags")?;
    info!("Marked {} peers offline", reset);

    let addr = SocketAddr::new(config.server.bind, config.server.port);
    if let Some(url) = &config.server.public_url {
        info!("Public URL: {}", url);
    }

    let server = PeerbookServer::new(broker);
    server.serve(addr).await.context("server failed")?;
    Ok(())
}
