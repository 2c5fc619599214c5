//! Test helpers: real servers on ephemeral localhost ports.

#![allow(dead_code)]

use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use veilchat_core::config::{DiscoveryConfig, PeerConfig, TransportConfig};
use veilchat_web::models::{DiscoveryState, PeerState};
use veilchat_web::{api, discovery, local, wait_for_shutdown};

pub const TEST_BITS: usize = 1024;

pub async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

pub fn serve(listener: TcpListener, router: Router) -> JoinHandle<()> {
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .expect("serve");
    })
}

pub struct Discovery {
    pub addr: SocketAddr,
    pub state: Arc<DiscoveryState>,
}

impl Discovery {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub async fn start_discovery(config: DiscoveryConfig) -> Discovery {
    let (listener, addr) = bind().await;
    let state = Arc::new(DiscoveryState::new(&config));
    serve(listener, discovery::router(Arc::clone(&state)));
    Discovery { addr, state }
}

pub struct Node {
    pub public: SocketAddr,
    pub local: SocketAddr,
    pub state: Arc<PeerState>,
    pub servers: Vec<JoinHandle<()>>,
}

impl Node {
    /// Address counterparts use for this node.
    pub fn address(&self) -> String {
        self.public.to_string()
    }

    pub fn public_url(&self, path: &str) -> String {
        format!("http://{}{}", self.public, path)
    }

    pub fn local_url(&self, path: &str) -> String {
        format!("http://{}{}", self.local, path)
    }

    /// Wait for both servers to finish a graceful shutdown.
    pub async fn stopped(self) {
        for server in self.servers {
            tokio::time::timeout(Duration::from_secs(10), server)
                .await
                .expect("server did not stop")
                .expect("server task");
        }
    }
}

pub fn peer_config(public_address: String, nickname: &str, discovery: &str) -> PeerConfig {
    PeerConfig {
        public_address,
        nickname: nickname.to_string(),
        discovery_address: discovery.to_string(),
        key_bits: TEST_BITS,
        transport: TransportConfig {
            socks_proxy: None,
            timeout: Duration::from_secs(5),
            ..TransportConfig::default()
        },
        ..PeerConfig::default()
    }
}

pub async fn start_node(nickname: &str, discovery: &str) -> Node {
    let (public_listener, public) = bind().await;
    let (local_listener, local) = bind().await;
    let config = peer_config(public.to_string(), nickname, discovery);
    let state = Arc::new(PeerState::new(config).expect("peer state"));

    let mut servers = Vec::new();
    for (listener, router) in [
        (public_listener, api::router(Arc::clone(&state))),
        (local_listener, local::router(Arc::clone(&state))),
    ] {
        let shutdown = wait_for_shutdown(state.shutdown.subscribe());
        servers.push(tokio::spawn(async move {
            axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(shutdown)
                .await
                .expect("serve");
        }));
    }

    Node {
        public,
        local,
        state,
        servers,
    }
}

/// An address nothing listens on.
pub async fn unused_address() -> String {
    let (listener, addr) = bind().await;
    drop(listener);
    addr.to_string()
}
