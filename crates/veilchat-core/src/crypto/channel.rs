//! Per-peer-pair secure channel.
//!
//! The initiator picks a random 32-byte session key and wraps it for the
//! responder with RSA-OAEP (SHA-256). Only the wrapped form ever crosses
//! the wire. Messages are encrypted with AES-256-CBC under a fresh
//! random IV per call.

use super::pem;
use super::random_bytes;
use crate::error::{Error, Result};
use crate::identity::{IdentityService, SESSION_KEY_SIZE};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rsa::Oaep;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Size of the CBC initialisation vector in bytes.
pub const IV_SIZE: usize = 16;

/// A ciphertext and the IV it was produced with, both base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// Base64 AES-256-CBC ciphertext.
    pub ciphertext: String,
    /// Base64 16-byte IV.
    pub iv: String,
}

/// Symmetric encryption context shared with one counterpart.
pub struct SecureChannel {
    session_key: Zeroizing<[u8; SESSION_KEY_SIZE]>,
    counterpart_public_key: String,
    counterpart_nickname: String,
    wrapped_session_key: Vec<u8>,
}

impl SecureChannel {
    /// Open a channel as initiator.
    ///
    /// Generates the session key and wraps it under the counterpart's
    /// public key.
    pub fn open(counterpart_public_key: &str, counterpart_nickname: &str) -> Result<Self> {
        let counterpart_public_key = pem::normalize_public_key_pem(counterpart_public_key);
        let public = pem::parse_public_key(&counterpart_public_key)?;

        let session_key = Zeroizing::new(random_bytes::<SESSION_KEY_SIZE>());
        let wrapped_session_key = public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), session_key.as_slice())
            .map_err(|_| Error::InvalidKey("cannot wrap session key for counterpart".into()))?;

        Ok(Self {
            session_key,
            counterpart_public_key,
            counterpart_nickname: counterpart_nickname.to_string(),
            wrapped_session_key,
        })
    }

    /// Accept a channel as responder, unwrapping the initiator's session
    /// key with the local private key.
    pub fn accept(
        identity: &IdentityService,
        counterpart_public_key: &str,
        counterpart_nickname: &str,
        wrapped_session_key: &[u8],
    ) -> Result<Self> {
        let session_key = identity.unwrap_session_key(wrapped_session_key)?;
        Ok(Self {
            session_key,
            counterpart_public_key: pem::normalize_public_key_pem(counterpart_public_key),
            counterpart_nickname: counterpart_nickname.to_string(),
            wrapped_session_key: wrapped_session_key.to_vec(),
        })
    }

    /// Counterpart's public key, normalised PEM. Authenticates every
    /// message after the handshake.
    pub fn counterpart_public_key(&self) -> &str {
        &self.counterpart_public_key
    }

    /// Counterpart's nickname as declared at handshake.
    pub fn counterpart_nickname(&self) -> &str {
        &self.counterpart_nickname
    }

    /// The wrapped session key.
    pub fn wrapped_session_key(&self) -> &[u8] {
        &self.wrapped_session_key
    }

    /// The wrapped session key, base64 encoded for the wire.
    pub fn wrapped_session_key_base64(&self) -> String {
        STANDARD.encode(&self.wrapped_session_key)
    }

    /// Encrypt a plaintext under a fresh random IV.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedMessage> {
        let iv = random_bytes::<IV_SIZE>();
        let cipher = Aes256CbcEnc::new_from_slices(self.session_key.as_slice(), &iv)
            .map_err(|_| Error::Internal("invalid cipher parameters".into()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(EncryptedMessage {
            ciphertext: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(iv),
        })
    }

    /// Decrypt a base64 ciphertext with its base64 IV.
    ///
    /// Bad base64, a wrong-length IV, bad padding and non-UTF-8
    /// plaintext all surface as [`Error::DecryptionFailed`].
    pub fn decrypt(&self, ciphertext_b64: &str, iv_b64: &str) -> Result<String> {
        let ciphertext = STANDARD
            .decode(ciphertext_b64)
            .map_err(|_| Error::DecryptionFailed)?;
        let iv = STANDARD.decode(iv_b64).map_err(|_| Error::DecryptionFailed)?;

        let cipher = Aes256CbcDec::new_from_slices(self.session_key.as_slice(), &iv)
            .map_err(|_| Error::DecryptionFailed)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
                .map_err(|_| Error::DecryptionFailed)?,
        );

        String::from_utf8(plaintext.to_vec()).map_err(|_| Error::DecryptionFailed)
    }
}

impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("counterpart_nickname", &self.counterpart_nickname)
            .field("session_key", &"[REDACTED]")
            .finish()
    }
}
