//! Sessions and messaging.
//!
//! - [`SessionRegistry`]: address to channel and history
//! - [`SessionProtocol`]: handshake, close and message exchange
//!
//! Messages are encrypted per session with AES-256-CBC; every envelope is
//! signed by the sender's RSA identity.

mod message;
mod protocol;
mod session;

pub use message::Message;
pub use protocol::{CloseOutcome, EstablishOutcome, LocalPeer, SessionProtocol};
pub use session::{SessionEntry, SessionRegistry, SessionState, SessionSummary};
