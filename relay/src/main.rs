use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::routing::{any, get};
use axum::Router;
use clap::Parser;
use tracing::info;

mod metrics;
mod pending;
mod proxy;
mod registry;
mod tunnel;

use metrics::Metrics;
use pending::PendingRequests;
use registry::Registry;

/// Public-facing relay: accepts tunnel clients on /ws and serves their
/// local HTTP services under subdomains of the configured domain.
#[derive(Debug, Parser)]
#[command(name = "porthole-relay", about = "HTTP reverse tunnel relay")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORTHOLE_PORT", default_value_t = 9090)]
    port: u16,

    /// Wildcard domain tunnels are exposed under
    #[arg(long, env = "PORTHOLE_DOMAIN")]
    domain: String,

    /// Token tunnel clients must present
    #[arg(long, env = "PORTHOLE_TOKEN")]
    token: String,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub pending: Arc<PendingRequests>,
    pub metrics: Metrics,
    pub domain: String,
    pub token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("porthole_relay=info")
        .init();

    let args = Args::parse();
    let state = AppState {
        registry: Arc::new(Registry::new()),
        pending: Arc::new(PendingRequests::new()),
        metrics: Metrics::new(),
        domain: args.domain.clone(),
        token: args.token,
    };

    let app = Router::new()
        .route("/ws", get(tunnel::ws_handler))
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics_handler))
        .fallback(any(proxy::handle))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Relay listening on {addr} (domain: {})", args.domain);
    info!("Control endpoint: ws://{}:{}/ws", args.domain, args.port);
    info!("Public tunnels: http://*.{}:{}", args.domain, args.port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.to_prometheus()
}
