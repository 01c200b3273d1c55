//! cirrus server binary.
//!
//! Loads configuration, builds the configured document services and serves
//! the selected one over a Unix domain socket.

use std::path::PathBuf;

use cirrus_core::{BackendKind, Config, build_registry};
use cirrus_server::CirrusServer;
use clap::Parser;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "cirrus-server", version, about = "Serve cirrus document storage over a Unix socket")]
struct Args {
    /// TOML configuration file. Defaults plus environment overrides when absent.
    #[arg(long, env = "CIRRUS_CONFIG")]
    config: Option<PathBuf>,

    /// Socket path.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Backend to serve, overriding the configuration.
    #[arg(long)]
    backend: Option<BackendKind>,
}

fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cirrus")
        .join("cirrus.sock")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let mut config = Config::load(path)?;
            config.apply_env()?;
            config
        }
        None => Config::from_env()?,
    };
    if let Some(backend) = args.backend {
        config.backend = backend;
    }

    let socket_path = args.socket.unwrap_or_else(default_socket_path);
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!(backend = %config.backend, socket = %socket_path.display(), "starting");

    let registry = build_registry(&config).await?;
    let service = registry.default_service()?;

    let server = CirrusServer::new(service, socket_path);
    server.run().await?;

    Ok(())
}
