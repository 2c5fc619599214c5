//! Outbound transport.
//!
//! The protocol layer talks to counterparts and to the discovery server
//! only through these traits. Addresses are opaque strings; what makes them
//! reachable (an onion service behind a SOCKS proxy, a loopback in tests)
//! is the implementation's business.

mod http;

pub use http::HttpTransport;

use crate::directory::PeerRecord;
use crate::error::Result;
use crate::protocol::{
    CloseSessionRequest, FetchFileRequest, RemoteFile, SignedEnvelope, StartSessionRequest,
    SubscribeRequest, UnsubscribeRequest,
};
use async_trait::async_trait;

/// Calls to a counterpart peer's public API.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver a signed handshake.
    async fn start_session(&self, address: &str, request: &StartSessionRequest) -> Result<()>;

    /// Notify a counterpart that the session is closed.
    async fn close_session(&self, address: &str, request: &CloseSessionRequest) -> Result<()>;

    /// Deliver a signed, encrypted message.
    async fn deliver_message(&self, address: &str, envelope: &SignedEnvelope) -> Result<()>;

    /// Fetch a blob from the counterpart's content store.
    async fn fetch_file(&self, address: &str, request: &FetchFileRequest) -> Result<RemoteFile>;
}

/// Calls to the discovery server.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Register or refresh this peer.
    async fn subscribe(&self, discovery: &str, request: &SubscribeRequest) -> Result<()>;

    /// Deregister this peer.
    async fn unsubscribe(&self, discovery: &str, request: &UnsubscribeRequest) -> Result<()>;

    /// List live peers, optionally only the one at `address`.
    async fn active_peers(&self, discovery: &str, address: Option<&str>) -> Result<Vec<PeerRecord>>;
}
