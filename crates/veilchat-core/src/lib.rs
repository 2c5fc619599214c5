//! # veilchat core library
//!
//! Mutually anonymous peers, reachable only through an anonymizing
//! transport, discover each other, establish authenticated encrypted
//! sessions and exchange messages and files without a trusted
//! intermediary holding plaintext.
//!
//! ## Trust model
//!
//! - The first handshake accepts a caller-declared public key
//!   (trust-on-first-use).
//! - Every later message on a session is authenticated against the key
//!   captured at handshake time.
//! - Only the initiator chooses the session key; it crosses the wire
//!   wrapped under the responder's public key.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        messaging (session protocol)     │
//! ├─────────────────────────────────────────┤
//! │ directory │ content │ admission │ transport │
//! ├─────────────────────────────────────────┤
//! │      store (TTL)   │   protocol (wire)   │
//! ├─────────────────────────────────────────┤
//! │    crypto (channel)  │    identity       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! All state is in memory and lost on restart.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod admission;
pub mod config;
pub mod content;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod identity;
pub mod logging;
pub mod messaging;
pub mod protocol;
pub mod store;
pub mod transport;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
