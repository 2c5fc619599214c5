//! Error types for veilchat.
//!
//! Cryptographic failures carry generic messages so that a remote
//! caller cannot use them as an oracle.

use std::time::Duration;
use thiserror::Error;

/// Core error type for veilchat operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request shape or missing field.
    #[error("validation error: {0}")]
    Validation(String),

    /// Signature or verification failure.
    #[error("sender not verified")]
    Authentication,

    /// A handshake crossed a local initiate and was declined.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No such peer, blob or session.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation requires an established session.
    #[error("no session with {0}")]
    NoSession(String),

    /// Counterpart or discovery service unreachable.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Counterpart or discovery service answered with an error status.
    #[error("upstream rejected request with status {status}")]
    UpstreamRejected {
        /// Status returned by the remote side.
        status: u16,
        /// Remote response body, for diagnostics.
        detail: String,
    },

    /// Outbound call exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// Local state committed, remote confirmation failed.
    #[error("partial failure: {0}")]
    PartialFailure(String),

    /// Ciphertext, IV or padding rejected.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Wrapped session key could not be unwrapped with the local key.
    #[error("session key unwrap failed")]
    UnwrapFailed,

    /// No identity key pair is loaded.
    #[error("identity key unavailable")]
    KeyUnavailable,

    /// Key material could not be parsed.
    #[error("invalid key material")]
    InvalidKey(String),

    /// Admission control rejected the request.
    #[error("too many requests")]
    RateLimited {
        /// How long the caller should wait before retrying.
        retry_after: Duration,
    },

    /// Encoding/decoding error.
    #[error("encoding error")]
    Encoding(String),

    /// Unexpected internal failure.
    #[error("internal error")]
    Internal(String),
}

/// Result type alias using veilchat's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Numeric status a request surface should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_)
            | Error::NoSession(_)
            | Error::DecryptionFailed
            | Error::UnwrapFailed
            | Error::InvalidKey(_)
            | Error::Encoding(_) => 400,
            Error::Authentication => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::RateLimited { .. } => 429,
            Error::PartialFailure(_) => 207,
            Error::UpstreamRejected { .. } => 502,
            Error::UpstreamUnavailable(_) | Error::Timeout => 503,
            Error::KeyUnavailable | Error::Internal(_) => 500,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
