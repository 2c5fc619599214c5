//! Data models for the web API

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use veilchat_core::admission::RateLimiter;
use veilchat_core::config::{AdmissionConfig, DiscoveryConfig, PeerConfig};
use veilchat_core::content::ContentStore;
use veilchat_core::directory::PeerDirectory;
use veilchat_core::identity::IdentityService;
use veilchat_core::messaging::{LocalPeer, SessionProtocol, SessionRegistry};
use veilchat_core::transport::{DiscoveryTransport, HttpTransport, PeerTransport};

/// Peer node shared state
pub struct PeerState {
    /// Handshake and messaging
    pub protocol: SessionProtocol,
    /// Blobs offered to counterparts
    pub content: ContentStore,
    /// Calls to the discovery server
    pub discovery: Arc<dyn DiscoveryTransport>,
    /// Node configuration
    pub config: PeerConfig,
    /// Counters for the peer-facing routes
    pub limiter: RateLimiter,
    /// Flipped to `true` to stop both servers
    pub shutdown: watch::Sender<bool>,
}

impl PeerState {
    /// Build a node that reaches peers and discovery over HTTP through
    /// the configured proxy.
    pub fn new(config: PeerConfig) -> veilchat_core::Result<Self> {
        let identity = Arc::new(IdentityService::new(config.key_bits)?);
        let http = Arc::new(HttpTransport::new(&config.transport)?);
        Ok(Self::with_transports(config, identity, http.clone(), http))
    }

    /// Build a node over explicit transports.
    pub fn with_transports(
        config: PeerConfig,
        identity: Arc<IdentityService>,
        peers: Arc<dyn PeerTransport>,
        discovery: Arc<dyn DiscoveryTransport>,
    ) -> Self {
        let protocol = SessionProtocol::new(
            identity,
            SessionRegistry::new(),
            peers,
            LocalPeer {
                address: config.public_address.clone(),
                nickname: config.nickname.clone(),
            },
            config.transport.timeout,
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            protocol,
            content: ContentStore::new(),
            discovery,
            config,
            limiter: RateLimiter::new(),
            shutdown,
        }
    }
}

/// Discovery server shared state
pub struct DiscoveryState {
    /// Live registrations
    pub directory: PeerDirectory,
    /// Counters for the discovery routes
    pub limiter: RateLimiter,
    /// Route budgets
    pub admission: AdmissionConfig,
}

impl DiscoveryState {
    /// Build an empty directory.
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            directory: PeerDirectory::new(config.peer_ttl),
            limiter: RateLimiter::new(),
            admission: config.admission.clone(),
        }
    }
}

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Human-readable outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub message: String,
}

impl Notice {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// This node's public details
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub address: String,
    pub nickname: String,
    pub public_key: String,
    pub fingerprint: String,
    pub discovery_server_url: String,
}

/// Local start-session request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionCommand {
    pub destination_address: String,
    #[serde(default)]
    pub destination_nickname: String,
    pub destination_public_key: String,
}

/// Local start-session result
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResult {
    pub message: String,
    pub newly_established: bool,
}

/// Local close-session request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseSessionCommand {
    pub destination_address: String,
}

/// Local send-message request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageCommand {
    pub destination_address: String,
    pub message: String,
}

/// Query of the local get-messages route
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub destination_address: Option<String>,
}

/// Query of the active-peers routes
#[derive(Debug, Deserialize)]
pub struct PeersQuery {
    pub address: Option<String>,
}

/// Local download-file request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFileCommand {
    pub destination_address: String,
    pub file_id: String,
    pub download_path: String,
}

/// Local download-file result
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedFile {
    pub path: String,
    pub size: usize,
    /// Content type the counterpart declared, if any
    pub content_type: Option<String>,
}

/// Local upload result
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub file_id: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Local delete result
#[derive(Debug, Serialize, Deserialize)]
pub struct DeletedFile {
    pub deleted: bool,
}
