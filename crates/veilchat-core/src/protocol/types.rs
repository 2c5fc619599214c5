//! Wire types.
//!
//! Field names are camelCase on the wire. Signed bodies split into a
//! payload (the signed part) and a detached `signature`.

use serde::{Deserialize, Serialize};

/// Handshake fields covered by the initiator's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    /// Initiator's address.
    pub sender_address: String,
    /// Initiator's nickname.
    pub sender_nickname: String,
    /// Initiator's self-asserted public key.
    pub sender_public_key: String,
    /// Session key wrapped for the responder, base64.
    pub wrapped_session_key: String,
}

/// Body of the start-session endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    /// Signed fields.
    #[serde(flatten)]
    pub payload: HandshakePayload,
    /// Base64 signature over the canonical payload.
    pub signature: String,
}

/// Body of the close-session endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseSessionRequest {
    /// Address of the closing peer.
    pub sender_address: String,
    /// Base64 signature over `sender_address`.
    pub signature: String,
}

/// Message fields covered by the sender's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Base64 ciphertext.
    pub ciphertext: String,
    /// Base64 IV.
    pub iv: String,
    /// Sender's address.
    pub sender_address: String,
}

/// Body of the send-message endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedEnvelope {
    /// Signed fields.
    #[serde(flatten)]
    pub envelope: MessageEnvelope,
    /// Base64 signature over the canonical envelope.
    pub signature: String,
}

/// Body of the download-file endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFileRequest {
    /// Id of the blob.
    pub file_id: String,
}

/// A blob fetched from a counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Raw bytes.
    pub bytes: Vec<u8>,
    /// Content type the counterpart reported.
    pub content_type: Option<String>,
    /// File name from `Content-Disposition`, if any.
    pub file_name: Option<String>,
}

/// Body of the discovery subscribe endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Subscribing peer's address.
    pub address: String,
    /// Nickname.
    pub nickname: String,
    /// Public key PEM.
    pub public_key: String,
}

/// Body of the discovery unsubscribe endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    /// Address to remove.
    pub address: String,
    /// Base64 signature over `address`.
    pub signature: String,
}
