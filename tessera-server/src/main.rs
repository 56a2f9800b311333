//! Tessera object store server binary.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tessera_server::{ServerConfig, ServerState};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tesserad")]
#[command(author = "Tessera Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Content-addressed object store server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:8080)
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        addr: String,

        /// Data directory for per-stream databases; omit for in-memory
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Require this bearer token on every request
        #[arg(long)]
        token: Option<String>,

        /// Accept uploads without verifying object hashes
        #[arg(long)]
        no_verify: bool,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            addr,
            data_dir,
            token,
            no_verify,
            debug,
        } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };

            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            info!("Starting tessera object store on {}", addr);
            match &data_dir {
                Some(dir) => info!("Data directory: {}", dir.display()),
                None => info!("No data directory configured, streams stay in memory"),
            }

            let state = Arc::new(ServerState::new(ServerConfig {
                data_dir,
                auth_token: token,
                verify_hashes: !no_verify,
            }));

            let addr: SocketAddr = addr.parse()?;
            let listener = TcpListener::bind(addr).await?;
            info!("Server listening on {}", addr);

            tessera_server::serve(listener, state).await
        }
    }
}
