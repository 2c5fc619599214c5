//! Configuration for peers, the discovery server and outbound transport.
//!
//! Binaries fill these from command-line arguments and the environment;
//! the `Default` impls hold the values a stock deployment runs with.

use crate::admission::RoutePolicy;
use std::time::Duration;

/// Default SOCKS5 proxy of the local anonymizing transport.
pub const DEFAULT_SOCKS_PROXY: &str = "socks5h://127.0.0.1:9050";

/// Default deadline for any outbound call (seconds).
pub const DEFAULT_OUTBOUND_TIMEOUT_SECS: u64 = 60;

/// Largest file body accepted from a counterpart or a local upload.
pub const DEFAULT_MAX_FILE_BYTES: usize = 64 * 1024 * 1024;

/// RSA modulus used for new identities.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Lifetime of a directory registration (seconds).
pub const DEFAULT_PEER_TTL_SECS: u64 = 3600;

/// Period of the background TTL sweep (seconds).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 120;

/// Outbound transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Proxy URL every outbound request goes through. `None` connects
    /// directly, which is only meant for local testing.
    pub socks_proxy: Option<String>,
    /// Per-request deadline.
    pub timeout: Duration,
    /// Cap on a downloaded file body.
    pub max_file_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socks_proxy: Some(DEFAULT_SOCKS_PROXY.to_string()),
            timeout: Duration::from_secs(DEFAULT_OUTBOUND_TIMEOUT_SECS),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

/// Per-route admission policies.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// start-session and close-session.
    pub session: RoutePolicy,
    /// send-message.
    pub send_message: RoutePolicy,
    /// download-file.
    pub download_file: RoutePolicy,
    /// subscribe and unsubscribe.
    pub subscription: RoutePolicy,
    /// active-peers.
    pub active_peers: RoutePolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            session: RoutePolicy::new("session", 10, Duration::from_secs(60))
                .keyed_by("senderAddress"),
            send_message: RoutePolicy::new("send-message", 1, Duration::from_secs(1))
                .keyed_by("senderAddress"),
            download_file: RoutePolicy::new("download-file", 30, Duration::from_secs(60)),
            subscription: RoutePolicy::new("subscription", 10, Duration::from_secs(60))
                .keyed_by("address"),
            active_peers: RoutePolicy::new("active-peers", 120, Duration::from_secs(60)),
        }
    }
}

/// Configuration of a peer node.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Address under which counterparts reach this peer.
    pub public_address: String,
    /// Nickname announced in handshakes and subscriptions.
    pub nickname: String,
    /// Address of the discovery server.
    pub discovery_address: String,
    /// RSA modulus for this peer's identity.
    pub key_bits: usize,
    /// Outbound transport.
    pub transport: TransportConfig,
    /// Admission policies for the peer-facing routes.
    pub admission: AdmissionConfig,
    /// Sweep period for the content store.
    pub sweep_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            public_address: "localhost:3055".to_string(),
            nickname: "anonymous".to_string(),
            discovery_address: "localhost:3000".to_string(),
            key_bits: DEFAULT_KEY_BITS,
            transport: TransportConfig::default(),
            admission: AdmissionConfig::default(),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

/// Configuration of the discovery server.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How long a subscription stays visible without renewal.
    pub peer_ttl: Duration,
    /// Sweep period for expired registrations.
    pub sweep_interval: Duration,
    /// Admission policies for the discovery routes.
    pub admission: AdmissionConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            peer_ttl: Duration::from_secs(DEFAULT_PEER_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            admission: AdmissionConfig::default(),
        }
    }
}
