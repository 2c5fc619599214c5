//! Handshake and messaging protocol.
//!
//! Moves each counterpart address through `NoSession -> Established ->
//! NoSession`. Two verification paths exist on purpose:
//!
//! - the handshake is checked against the key the sender *claims*
//!   (trust-on-first-use);
//! - close and message traffic are checked against the key captured when
//!   the session was established.
//!
//! No registry lock is held across an outbound call, and every outbound
//! call is bounded by the configured timeout.
//!
//! When two peers initiate towards each other at the same time, the
//! handshake from the lexicographically lower address is kept on both
//! sides: the lower peer declines the crossing handshake while its own is
//! in flight, the higher peer yields to it.
//!
//! Identity rotation holds a write gate that handshakes take for reading,
//! so no session is created with the old key once rotation has begun.

use super::message::Message;
use super::session::{InboundOutcome, KeyedLocks, SessionRegistry, SessionState, SessionSummary};
use crate::crypto::SecureChannel;
use crate::error::{Error, Result};
use crate::identity::{self, IdentityService};
use crate::logging::{RedactedAddress, RedactedBytes};
use crate::protocol::{
    canonical_json, CloseSessionRequest, FetchFileRequest, HandshakePayload, MessageEnvelope,
    RemoteFile, SignedEnvelope, StartSessionRequest,
};
use crate::transport::PeerTransport;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Result of an establish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishOutcome {
    /// A new session was created.
    Established,
    /// A session already existed and was left untouched.
    AlreadyEstablished,
}

/// Result of a close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// There was no session to close.
    NoSession,
    /// Closed locally and, for a local close, confirmed remotely.
    Closed,
    /// Closed locally; notifying the counterpart failed.
    ClosedLocally {
        /// Why the notification failed.
        reason: String,
    },
}

impl CloseOutcome {
    /// Whether the counterpart did not confirm.
    pub fn is_partial(&self) -> bool {
        matches!(self, CloseOutcome::ClosedLocally { .. })
    }
}

/// How this peer presents itself to counterparts.
#[derive(Debug, Clone)]
pub struct LocalPeer {
    /// Address counterparts reach this peer under.
    pub address: String,
    /// Nickname sent in handshakes.
    pub nickname: String,
}

/// Session orchestration for one peer.
pub struct SessionProtocol {
    identity: Arc<IdentityService>,
    sessions: SessionRegistry,
    transport: Arc<dyn PeerTransport>,
    local: LocalPeer,
    timeout: Duration,
    initiating: KeyedLocks,
    rotation: RwLock<()>,
}

impl SessionProtocol {
    /// Create a protocol instance over the given identity, registry and
    /// transport.
    pub fn new(
        identity: Arc<IdentityService>,
        sessions: SessionRegistry,
        transport: Arc<dyn PeerTransport>,
        local: LocalPeer,
        timeout: Duration,
    ) -> Self {
        Self {
            identity,
            sessions,
            transport,
            local,
            timeout,
            initiating: KeyedLocks::default(),
            rotation: RwLock::new(()),
        }
    }

    /// The identity this protocol signs with.
    pub fn identity(&self) -> &Arc<IdentityService> {
        &self.identity
    }

    /// The session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// This peer's presentation.
    pub fn local(&self) -> &LocalPeer {
        &self.local
    }

    /// State of the session with `address`.
    pub async fn session_state(&self, address: &str) -> SessionState {
        self.sessions.state(address).await
    }

    /// Summaries of all established sessions.
    pub async fn active_sessions(&self) -> Vec<SessionSummary> {
        self.sessions.summaries().await
    }

    async fn outbound<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Establish a session with `address` as initiator.
    ///
    /// Concurrent initiates for one address produce a single handshake.
    /// If the counterpart's own handshake is kept instead of ours, that
    /// session stands and this returns
    /// [`EstablishOutcome::AlreadyEstablished`].
    pub async fn initiate(
        &self,
        address: &str,
        public_key: &str,
        nickname: &str,
    ) -> Result<EstablishOutcome> {
        require("destinationAddress", address)?;
        require("destinationPublicKey", public_key)?;

        let _guard = self.initiating.lock(address).await;
        let _rotation = self.rotation.read().await;
        let Some(in_flight) = self.sessions.begin_initiate(address).await else {
            debug!(to = %RedactedAddress(address), "Session already established");
            return Ok(EstablishOutcome::AlreadyEstablished);
        };

        let outcome = match self.send_handshake(address, public_key, nickname).await {
            Ok(channel) => {
                if self.sessions.insert_if_absent(address, Arc::new(channel)).await {
                    info!(with = %RedactedAddress(address), "Session established");
                    EstablishOutcome::Established
                } else {
                    debug!(with = %RedactedAddress(address), "Counterpart handshake was accepted first");
                    EstablishOutcome::AlreadyEstablished
                }
            }
            Err(e) => {
                if self.sessions.state(address).await != SessionState::Established {
                    return Err(e);
                }
                info!(with = %RedactedAddress(address), error = %e, "Counterpart handshake took precedence");
                EstablishOutcome::AlreadyEstablished
            }
        };
        drop(in_flight);
        Ok(outcome)
    }

    async fn send_handshake(&self, address: &str, public_key: &str, nickname: &str) -> Result<SecureChannel> {
        let channel = SecureChannel::open(public_key, nickname)?;
        let payload = HandshakePayload {
            sender_address: self.local.address.clone(),
            sender_nickname: self.local.nickname.clone(),
            sender_public_key: self.identity.public_key()?,
            wrapped_session_key: channel.wrapped_session_key_base64(),
        };
        let signature = self.identity.sign(canonical_json(&payload)?.as_bytes())?;
        let request = StartSessionRequest { payload, signature };

        self.outbound(self.transport.start_session(address, &request))
            .await?;
        Ok(channel)
    }

    /// Handle a handshake from a counterpart.
    ///
    /// Never waits on a local initiate for the same address. A handshake
    /// crossing a local initiate is declined with [`Error::Conflict`] when
    /// this peer's address sorts lower than the sender's.
    pub async fn accept_incoming(&self, request: &StartSessionRequest) -> Result<EstablishOutcome> {
        let payload = &request.payload;
        require("senderAddress", &payload.sender_address)?;
        require("senderPublicKey", &payload.sender_public_key)?;
        require("wrappedSessionKey", &payload.wrapped_session_key)?;
        require("signature", &request.signature)?;

        let signed = canonical_json(payload)?;
        if !identity::verify(signed.as_bytes(), &request.signature, &payload.sender_public_key) {
            warn!(from = %RedactedAddress(&payload.sender_address), "Handshake signature rejected");
            return Err(Error::Authentication);
        }

        let address = payload.sender_address.as_str();
        let _rotation = self.rotation.read().await;
        if self.sessions.state(address).await == SessionState::Established {
            return Ok(EstablishOutcome::AlreadyEstablished);
        }

        let wrapped = STANDARD
            .decode(&payload.wrapped_session_key)
            .map_err(|_| Error::Validation("wrappedSessionKey is not valid base64".into()))?;
        debug!(from = %RedactedAddress(address), key = %RedactedBytes(&wrapped), "Unwrapping session key");
        let channel = SecureChannel::accept(
            &self.identity,
            &payload.sender_public_key,
            &payload.sender_nickname,
            &wrapped,
        )?;

        let defer = self.local.address.as_str() < address;
        match self.sessions.insert_inbound(address, Arc::new(channel), defer).await {
            InboundOutcome::Inserted => {
                info!(with = %RedactedAddress(address), "Session accepted");
                Ok(EstablishOutcome::Established)
            }
            InboundOutcome::Existing => Ok(EstablishOutcome::AlreadyEstablished),
            InboundOutcome::Deferred => {
                info!(from = %RedactedAddress(address), "Crossing handshake declined in favour of local initiate");
                Err(Error::Conflict(format!(
                    "handshake from {} crossed a local initiate",
                    RedactedAddress(address)
                )))
            }
        }
    }

    /// Close the session with `address`.
    ///
    /// The local entry is removed first; the counterpart is then notified
    /// best-effort. A failed notification yields
    /// [`CloseOutcome::ClosedLocally`], never an error.
    pub async fn close_session(&self, address: &str) -> Result<CloseOutcome> {
        require("destinationAddress", address)?;

        if self.sessions.remove(address).await.is_none() {
            return Ok(CloseOutcome::NoSession);
        }
        info!(with = %RedactedAddress(address), "Session closed locally");

        match self.notify_close(address).await {
            Ok(()) => Ok(CloseOutcome::Closed),
            Err(e) => {
                warn!(with = %RedactedAddress(address), error = %e, "Counterpart did not confirm close");
                Ok(CloseOutcome::ClosedLocally {
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn notify_close(&self, address: &str) -> Result<()> {
        let request = CloseSessionRequest {
            sender_address: self.local.address.clone(),
            signature: self.identity.sign(self.local.address.as_bytes())?,
        };
        self.outbound(self.transport.close_session(address, &request))
            .await
    }

    /// Handle a close notification from a counterpart.
    pub async fn accept_close(&self, request: &CloseSessionRequest) -> Result<CloseOutcome> {
        require("senderAddress", &request.sender_address)?;
        require("signature", &request.signature)?;

        let address = request.sender_address.as_str();
        let Some(channel) = self.sessions.channel(address).await else {
            return Ok(CloseOutcome::NoSession);
        };

        if !identity::verify(address.as_bytes(), &request.signature, channel.counterpart_public_key()) {
            warn!(from = %RedactedAddress(address), "Close signature rejected");
            return Err(Error::Authentication);
        }

        if self.sessions.remove_if_same(address, &channel).await {
            info!(with = %RedactedAddress(address), "Session closed by counterpart");
            Ok(CloseOutcome::Closed)
        } else {
            Ok(CloseOutcome::NoSession)
        }
    }

    /// Encrypt, sign and deliver a message, then record it locally.
    pub async fn send_message(&self, address: &str, plaintext: &str) -> Result<()> {
        require("destinationAddress", address)?;

        let channel = self
            .sessions
            .channel(address)
            .await
            .ok_or_else(|| Error::NoSession(RedactedAddress(address).to_string()))?;

        let encrypted = channel.encrypt(plaintext)?;
        let envelope = MessageEnvelope {
            ciphertext: encrypted.ciphertext,
            iv: encrypted.iv,
            sender_address: self.local.address.clone(),
        };
        let signature = self.identity.sign(canonical_json(&envelope)?.as_bytes())?;
        let signed = SignedEnvelope { envelope, signature };

        self.outbound(self.transport.deliver_message(address, &signed))
            .await?;

        let recorded = self
            .sessions
            .append_if_same(address, &channel, Message::new(&self.local.address, plaintext))
            .await;
        if !recorded {
            debug!(to = %RedactedAddress(address), "Session closed before message was recorded");
        }
        debug!(to = %RedactedAddress(address), len = plaintext.len(), "Message sent");
        Ok(())
    }

    /// Handle an encrypted message from a counterpart.
    pub async fn receive_message(&self, signed: &SignedEnvelope) -> Result<()> {
        let envelope = &signed.envelope;
        require("senderAddress", &envelope.sender_address)?;
        require("ciphertext", &envelope.ciphertext)?;
        require("iv", &envelope.iv)?;
        require("signature", &signed.signature)?;

        let address = envelope.sender_address.as_str();
        let channel = self
            .sessions
            .channel(address)
            .await
            .ok_or_else(|| Error::NoSession(RedactedAddress(address).to_string()))?;

        let bytes = canonical_json(envelope)?;
        if !identity::verify(bytes.as_bytes(), &signed.signature, channel.counterpart_public_key()) {
            warn!(from = %RedactedAddress(address), "Message signature rejected");
            return Err(Error::Authentication);
        }

        let plaintext = channel.decrypt(&envelope.ciphertext, &envelope.iv)?;
        let len = plaintext.len();
        if !self
            .sessions
            .append_if_same(address, &channel, Message::new(address, plaintext))
            .await
        {
            return Err(Error::NoSession(RedactedAddress(address).to_string()));
        }
        debug!(from = %RedactedAddress(address), len, "Message received");
        Ok(())
    }

    /// The full history of the session with `address`.
    ///
    /// Not draining: repeated calls return earlier messages again.
    pub async fn fetch_messages(&self, address: &str) -> Result<Vec<Message>> {
        require("destinationAddress", address)?;
        self.sessions
            .messages(address)
            .await
            .ok_or_else(|| Error::NotFound(format!("session with {}", RedactedAddress(address))))
    }

    /// Fetch a blob from a counterpart's content store.
    pub async fn fetch_file(&self, address: &str, file_id: &str) -> Result<RemoteFile> {
        require("destinationAddress", address)?;
        require("fileId", file_id)?;
        let request = FetchFileRequest {
            file_id: file_id.to_string(),
        };
        self.outbound(self.transport.fetch_file(address, &request))
            .await
    }

    /// Rotate the identity key pair and drop every session, since
    /// counterparts hold channels bound to the old key.
    ///
    /// Handshakes wait while the rotation runs.
    pub async fn reset_identity(&self) -> Result<()> {
        let _rotation = self.rotation.write().await;
        let identity = Arc::clone(&self.identity);
        tokio::task::spawn_blocking(move || identity.generate())
            .await
            .map_err(|e| Error::Internal(format!("key generation task failed: {}", e)))??;

        let dropped = self.sessions.len().await;
        self.sessions.clear().await;
        info!(dropped, bits = self.identity.key_bits(), "Identity rotated, sessions cleared");
        Ok(())
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
    }
    Ok(())
}
