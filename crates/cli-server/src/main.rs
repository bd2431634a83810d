//! CLI entry point for the encode-farm server.
//!
//! Parses command line arguments, loads the TOML configuration and runs
//! the WebSocket encode server.

use clap::Parser;
use encode_farm::{EncodeServer, EncodeServerConfig};
use encode_farm_config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// encode-farm server - remote execution endpoint for transcoding jobs
#[derive(Parser, Debug)]
#[command(name = "encode-farm-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the configured listener port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the configured server name
    #[arg(short, long)]
    name: Option<String>,

    /// Override the configured maximum concurrent jobs
    #[arg(long)]
    max_jobs: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(name) = args.name {
        config.server.name = name;
    }
    if let Some(max_jobs) = args.max_jobs {
        config.server.max_jobs = max_jobs;
    }

    let server_config = EncodeServerConfig::from(&config);
    tracing::info!(
        name = %server_config.name,
        bind = %server_config.bind,
        port = server_config.port,
        max_jobs = server_config.max_jobs,
        "starting encode server"
    );

    let server = EncodeServer::new(server_config);
    if let Err(e) = server.run().await {
        eprintln!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
