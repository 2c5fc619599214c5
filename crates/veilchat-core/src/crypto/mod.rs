//! Cryptographic primitives for veilchat.
//!
//! - **RSA-2048**: identity signatures (PKCS#1 v1.5, SHA-256) and
//!   session key transport (OAEP, SHA-256)
//! - **AES-256-CBC**: message encryption, fresh random IV per message
//! - **SHA-256**: key fingerprints
//!
//! Secret key material is zeroized on drop.

mod channel;
pub mod pem;

pub use channel::{EncryptedMessage, SecureChannel, IV_SIZE};

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}
