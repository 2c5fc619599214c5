//! Peer-to-peer and discovery wire protocol.
//!
//! ## Signing
//!
//! Structured payloads are signed over their canonical JSON: object keys
//! sorted lexicographically at every level, no insignificant whitespace.
//! Signer and verifier both go through [`canonical_json`], so field order
//! in the struct definitions never matters.

mod types;

pub use types::*;

use crate::error::Result;
use serde::Serialize;
use serde_json::Value;

/// Route paths shared by servers and the HTTP transport.
pub mod routes {
    /// Accept an inbound handshake.
    pub const START_SESSION: &str = "/api/start-session";
    /// Accept a close notification.
    pub const CLOSE_SESSION: &str = "/api/close-session";
    /// Receive an encrypted message.
    pub const SEND_MESSAGE: &str = "/api/send-message";
    /// Fetch a cached blob.
    pub const DOWNLOAD_FILE: &str = "/api/download-file";
    /// Discovery: register.
    pub const SUBSCRIBE: &str = "/subscribe";
    /// Discovery: deregister.
    pub const UNSUBSCRIBE: &str = "/unsubscribe";
    /// Discovery: list live peers.
    pub const ACTIVE_PEERS: &str = "/active-peers";
}

/// Serialise a value to canonical JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = sort_keys(serde_json::to_value(value)?);
    Ok(serde_json::to_string(&value)?)
}

// Explicit so the order holds even if `preserve_order` gets enabled.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
