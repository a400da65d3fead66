//! cors-relay
//!
//! A CORS-bypassing reverse proxy: `METHOD /?url=<target>` is forwarded to
//! the target and relayed back with permissive CORS headers.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────┐
//!                        │                    CORS RELAY                     │
//!   Client Request       │  ┌────────┐   ┌───────────┐   ┌──────────────┐   │
//!   ─────────────────────┼─▶│  http  │──▶│ security  │──▶│    proxy     │   │
//!                        │  │ server │   │ admission │   │   dispatch   │   │
//!                        │  └────────┘   └───────────┘   └──────┬───────┘   │
//!                        │                                      │           │
//!                        │      ┌───────────────┬───────────────┤           │
//!                        │      ▼               ▼               ▼           │
//!                        │ ┌──────────┐   ┌──────────┐   ┌────────────┐     │
//!                        │ │resilience│   │  cache   │   │  coalesce  │     │
//!                        │ │ circuits │   │ LRU/gzip │   │local/dist. │     │
//!                        │ └──────────┘   └────┬─────┘   └─────┬──────┘     │
//!                        │                     └──── store ────┘            │
//!                        │                         (redis)                  │
//!   Client Response      │                                                  │       Target
//!   ◀────────────────────┼──────────── proxy::forward (reqwest) ◀───────────┼────── Server
//!                        └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use cors_relay::config::loader::load_or_default;
use cors_relay::config::watcher::ConfigWatcher;
use cors_relay::lifecycle::signals::spawn_signal_listener;
use cors_relay::lifecycle::{build_services, Shutdown};
use cors_relay::observability::{logging, metrics};
use cors_relay::HttpServer;

#[derive(Parser)]
#[command(name = "cors-relay", version, about = "CORS-bypassing reverse proxy")]
struct Args {
    /// TOML configuration file. Watched for changes.
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override listener.bind_address.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = load_or_default(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.listener.bind_address = bind;
    }

    logging::init(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "cors-relay starting");

    let prometheus = if config.observability.metrics_enabled {
        match metrics::install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "Failed to install Prometheus recorder");
                None
            }
        }
    } else {
        None
    };

    let bind_address = config.listener.bind_address.clone();
    let services = build_services(config, prometheus)?;

    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    spawn_signal_listener(shutdown.clone());

    // The watcher stops when dropped, so it lives until main returns.
    let (_watcher, config_updates) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(handle) => (Some(handle), updates),
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                    (None, updates)
                }
            }
        }
        None => (None, mpsc::unbounded_channel().1),
    };

    HttpServer::new(services)
        .run(listener, config_updates, shutdown)
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
