//! veilchat peer node
//!
//! Serves the peer-to-peer API on the public port (reached by counterparts
//! through the anonymizing transport) and the local control API on
//! localhost. Outbound calls go through the configured SOCKS proxy.

use anyhow::{Context, Result};
use clap::Parser;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use veilchat_core::config::{
    PeerConfig, TransportConfig, DEFAULT_KEY_BITS, DEFAULT_OUTBOUND_TIMEOUT_SECS, DEFAULT_SOCKS_PROXY,
};
use veilchat_core::logging::RedactedAddress;
use veilchat_web::models::PeerState;
use veilchat_web::{api, local, wait_for_shutdown};

#[derive(Parser, Debug)]
#[command(name = "veilchat-peer")]
#[command(author, version, about = "veilchat peer node")]
struct Args {
    /// Address counterparts use to reach this peer (e.g. the hidden service host)
    #[arg(short, long, env = "VEILCHAT_PEER_URL", default_value = "localhost:3055")]
    address: String,

    /// Nickname announced to counterparts and the discovery server
    #[arg(short, long, env = "VEILCHAT_NICKNAME", default_value = "anonymous")]
    nickname: String,

    /// Interface the peer-to-peer API binds to
    #[arg(long, env = "VEILCHAT_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port of the peer-to-peer API
    #[arg(short, long, env = "VEILCHAT_PEER_PORT", default_value_t = 3055)]
    port: u16,

    /// Port of the local control API (always bound to localhost)
    #[arg(long, env = "VEILCHAT_LOCAL_PEER_PORT", default_value_t = 3056)]
    local_port: u16,

    /// Address of the discovery server
    #[arg(short, long, env = "VEILCHAT_DISCOVERY_SERVER_URL", default_value = "localhost:3000")]
    discovery: String,

    /// SOCKS proxy for outbound calls
    #[arg(long, env = "VEILCHAT_SOCKS_PROXY", default_value = DEFAULT_SOCKS_PROXY)]
    socks_proxy: String,

    /// Connect directly instead of through the proxy (local testing only)
    #[arg(long)]
    no_proxy: bool,

    /// Deadline for outbound calls in seconds
    #[arg(long, env = "VEILCHAT_TIMEOUT_SECS", default_value_t = DEFAULT_OUTBOUND_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// RSA modulus of the identity key
    #[arg(long, env = "VEILCHAT_KEY_BITS", default_value_t = DEFAULT_KEY_BITS)]
    key_bits: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            public_address: self.address.clone(),
            nickname: self.nickname.clone(),
            discovery_address: self.discovery.clone(),
            key_bits: self.key_bits,
            transport: TransportConfig {
                socks_proxy: (!self.no_proxy).then(|| self.socks_proxy.clone()),
                timeout: Duration::from_secs(self.timeout_secs),
                ..TransportConfig::default()
            },
            ..PeerConfig::default()
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = args.peer_config();
    if config.transport.socks_proxy.is_none() {
        warn!("Outbound calls bypass the proxy");
    }

    info!(bits = config.key_bits, "Generating identity");
    let sweep_interval = config.sweep_interval;
    let state = Arc::new(
        tokio::task::spawn_blocking(move || PeerState::new(config))
            .await
            .context("identity generation task failed")??,
    );
    let _sweeper = state.content.spawn_sweeper(sweep_interval);

    let public_addr = format!("{}:{}", args.bind, args.port);
    let public_listener = TcpListener::bind(&public_addr)
        .await
        .with_context(|| format!("failed to bind {}", public_addr))?;
    let local_addr = SocketAddr::from(([127, 0, 0, 1], args.local_port));
    let local_listener = TcpListener::bind(local_addr)
        .await
        .with_context(|| format!("failed to bind {}", local_addr))?;

    info!(
        version = veilchat_core::VERSION,
        address = %RedactedAddress(&args.address),
        public = %public_addr,
        local = %local_addr,
        fingerprint = %state.protocol.identity().fingerprint()?,
        "veilchat peer started"
    );

    // Ctrl-C and POST /local/shutdown both end up on the watch channel.
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            shutdown.send_replace(true);
        }
    });

    let public = axum::serve(
        public_listener,
        api::router(Arc::clone(&state)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(state.shutdown.subscribe()));

    let local = axum::serve(
        local_listener,
        local::router(Arc::clone(&state)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(state.shutdown.subscribe()));

    tokio::try_join!(public.into_future(), local.into_future())?;

    info!("veilchat peer stopped");
    Ok(())
}
