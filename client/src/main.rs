use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

mod config;
mod forwarder;
mod tunnel;

use config::ClientConfig;
use tunnel::TunnelClient;

/// Expose a local HTTP service through a porthole relay.
#[derive(Debug, Parser)]
#[command(name = "porthole")]
#[command(version)]
#[command(about = "HTTP reverse tunnel client", long_about = None)]
struct Cli {
    /// Local port to forward requests to
    #[arg(short, long)]
    port: Option<u16>,

    /// Relay base URL (overrides config file)
    #[arg(long, env = "PORTHOLE_SERVER")]
    server: Option<String>,

    /// Authentication token (overrides config file)
    #[arg(long, env = "PORTHOLE_TOKEN")]
    token: Option<String>,

    /// Request a specific subdomain
    #[arg(short, long)]
    subdomain: Option<String>,

    /// Config file path (default: search for porthole.yml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "porthole_client=debug"
    } else {
        "porthole_client=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let file = match &cli.config {
        Some(path) => ClientConfig::load(path)?,
        None => match ClientConfig::find_config() {
            Some(path) => ClientConfig::load(&path)?,
            None => ClientConfig::default(),
        },
    };

    let server = cli
        .server
        .or(file.server)
        .context("No relay URL configured. Pass --server or set it in porthole.yml")?;
    let token = cli
        .token
        .or(file.token)
        .context("No token configured. Pass --token or set it in porthole.yml")?;
    let port = cli.port.or(file.local_port).unwrap_or(3000);
    let subdomain = cli.subdomain.or(file.subdomain);

    println!("🏠 Starting tunnel for localhost:{port}");
    println!("🌐 Relay: {server}");
    if let Some(label) = &subdomain {
        println!("🎯 Requesting subdomain: {label}");
    }

    let client = TunnelClient::new(server, token, port, subdomain);
    client.run().await?;

    println!("👋 Tunnel closed. Goodbye!");
    Ok(())
}
