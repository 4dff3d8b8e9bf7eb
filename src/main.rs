mod config;
mod event;
mod filter;
mod hub;
mod ingest;
mod server;
mod store;
mod ws;

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use config::Settings;
use store::Store;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "homestr", author, version, about = "Personal SQLite-backed Nostr relay")]
struct Cli {
    /// Path to an optional `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Run the relay until interrupted.
    Serve,
    /// Remove expired events and compact the database file.
    Vacuum,
}

/// Execute the selected subcommand; the returned code becomes the exit code
/// (0 normal, 1 fatal init failure, 2 bind failure).
async fn run(cli: Cli) -> i32 {
    let cfg = match Settings::from_env(&cli.env) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration error: {e:#}");
            return 1;
        }
    };
    let store = match Store::open(&cfg.data_dir) {
        Ok(store) => store,
        Err(e) => {
            error!("store init failed: {e:#}");
            return 1;
        }
    };
    match cli.command {
        Commands::Serve => {
            let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("binding {addr} failed: {e}");
                    return 2;
                }
            };
            info!(%addr, name = %cfg.name, owner_only = cfg.owner_only, "relay listening");
            let state = server::build_state(cfg, store);
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            if let Err(e) = server::serve(listener, state, shutdown).await {
                error!("server error: {e:#}");
                return 1;
            }
            0
        }
        Commands::Vacuum => match store.vacuum(event::unix_now()) {
            Ok(removed) => {
                info!(removed, "vacuum complete");
                0
            }
            Err(e) => {
                error!("vacuum failed: {e:#}");
                1
            }
        },
    }
}

#[cfg(not(test))]
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}
