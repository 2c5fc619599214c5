//! veilchat discovery server
//!
//! Keeps a TTL-bounded directory of live peers. Peers subscribe with their
//! address, nickname and public key, renew by subscribing again, and leave
//! with a signed unsubscribe.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use veilchat_core::config::{DiscoveryConfig, DEFAULT_PEER_TTL_SECS, DEFAULT_SWEEP_INTERVAL_SECS};
use veilchat_web::discovery;
use veilchat_web::models::DiscoveryState;

#[derive(Parser, Debug)]
#[command(name = "veilchat-discovery")]
#[command(author, version, about = "veilchat discovery server")]
struct Args {
    /// Listen address
    #[arg(short, long, env = "VEILCHAT_DISCOVERY_LISTEN", default_value = "127.0.0.1")]
    listen: String,

    /// Listen port
    #[arg(short, long, env = "VEILCHAT_SERVER_PORT", default_value_t = 3000)]
    port: u16,

    /// Seconds a subscription stays visible without renewal
    #[arg(short, long, env = "VEILCHAT_TTL_ACTIVE_PEERS", default_value_t = DEFAULT_PEER_TTL_SECS)]
    ttl: u64,

    /// Seconds between sweeps of expired registrations
    #[arg(long, env = "VEILCHAT_SWEEP_INTERVAL", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    sweep_interval: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            peer_ttl: Duration::from_secs(self.ttl),
            sweep_interval: Duration::from_secs(self.sweep_interval.max(1)),
            ..DiscoveryConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = args.discovery_config();
    let state = Arc::new(DiscoveryState::new(&config));
    let _sweeper = state.directory.spawn_sweeper(config.sweep_interval);

    let addr = format!("{}:{}", args.listen, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(
        version = veilchat_core::VERSION,
        address = %addr,
        ttl_secs = args.ttl,
        sweep_secs = args.sweep_interval,
        "veilchat discovery server started"
    );

    axum::serve(
        listener,
        discovery::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
        }
    })
    .await?;

    info!("veilchat discovery server stopped");
    Ok(())
}
