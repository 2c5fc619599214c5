//! Identity management for veilchat.
//!
//! A peer's identity is a single RSA key pair, generated at process
//! start and held only in memory. There is no persistence and no
//! recovery: a reset generates a fresh pair.
//!
//! ## Signatures
//!
//! RSASSA-PKCS1-v1_5 over SHA-256, transported as base64. Signing is
//! deterministic for a given key and message.
//!
//! ## Reset
//!
//! [`IdentityService::generate`] replaces the held pair. Every signature
//! made with the old key stops verifying against the new public key and
//! counterparts can no longer wrap keys for the old one, so callers that
//! rotate identity must also drop their sessions
//! (see `SessionProtocol::reset_identity`).

use crate::crypto::pem;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use std::sync::{Arc, RwLock};
use zeroize::Zeroizing;

/// Size of the symmetric session key carried by key transport.
pub const SESSION_KEY_SIZE: usize = 32;

/// A loaded key pair.
struct KeyPair {
    private: RsaPrivateKey,
    signing: SigningKey<Sha256>,
    public: RsaPublicKey,
    public_pem: String,
}

impl KeyPair {
    fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| Error::Internal(format!("key generation failed: {}", e)))?;
        let public = RsaPublicKey::from(&private);
        let public_pem = pem::encode_public_key(&public)?;
        let signing = SigningKey::<Sha256>::new(private.clone());
        Ok(Self {
            private,
            signing,
            public,
            public_pem,
        })
    }
}

/// Owns this peer's asymmetric key pair.
///
/// Shared by reference (`Arc`) with every component that signs or
/// needs the public key. The private key never leaves the service.
pub struct IdentityService {
    key_bits: usize,
    keys: RwLock<Option<Arc<KeyPair>>>,
}

impl IdentityService {
    /// Create a service with a freshly generated key pair.
    pub fn new(key_bits: usize) -> Result<Self> {
        let service = Self::without_keys(key_bits);
        service.generate()?;
        Ok(service)
    }

    /// Create a service that holds no key pair yet.
    ///
    /// Every key operation fails with [`Error::KeyUnavailable`] until
    /// [`generate`](Self::generate) is called.
    pub fn without_keys(key_bits: usize) -> Self {
        Self {
            key_bits,
            keys: RwLock::new(None),
        }
    }

    /// Generate a fresh key pair, replacing any existing one.
    pub fn generate(&self) -> Result<()> {
        let pair = KeyPair::generate(self.key_bits)?;
        let mut keys = self
            .keys
            .write()
            .map_err(|_| Error::Internal("identity lock poisoned".into()))?;
        *keys = Some(Arc::new(pair));
        Ok(())
    }

    fn current(&self) -> Result<Arc<KeyPair>> {
        self.keys
            .read()
            .map_err(|_| Error::Internal("identity lock poisoned".into()))?
            .clone()
            .ok_or(Error::KeyUnavailable)
    }

    /// Modulus size used for generated keys.
    pub fn key_bits(&self) -> usize {
        self.key_bits
    }

    /// Sign a message, returning the base64 signature.
    pub fn sign(&self, message: &[u8]) -> Result<String> {
        let keys = self.current()?;
        let signature = keys
            .signing
            .try_sign(message)
            .map_err(|_| Error::Internal("signing failed".into()))?;
        Ok(STANDARD.encode(signature.to_bytes()))
    }

    /// This peer's public key as normalised PEM.
    pub fn public_key(&self) -> Result<String> {
        Ok(self.current()?.public_pem.clone())
    }

    /// SHA-256 fingerprint of the public key, hex encoded.
    pub fn fingerprint(&self) -> Result<String> {
        pem::fingerprint(&self.current()?.public)
    }

    /// Unwrap a session key that a counterpart encrypted for this peer
    /// with RSA-OAEP (SHA-256).
    pub fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<Zeroizing<[u8; SESSION_KEY_SIZE]>> {
        let keys = self.current()?;
        let plain = Zeroizing::new(
            keys.private
                .decrypt(Oaep::new::<Sha256>(), wrapped)
                .map_err(|_| Error::UnwrapFailed)?,
        );
        let key: [u8; SESSION_KEY_SIZE] = plain
            .as_slice()
            .try_into()
            .map_err(|_| Error::UnwrapFailed)?;
        Ok(Zeroizing::new(key))
    }
}

impl fmt::Debug for IdentityService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loaded = self.keys.read().map(|k| k.is_some()).unwrap_or(false);
        f.debug_struct("IdentityService")
            .field("key_bits", &self.key_bits)
            .field("loaded", &loaded)
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Verify a base64 signature over `message` against a PEM public key.
///
/// Never fails: malformed signatures, undecodable base64 and unparsable
/// keys all verify as `false`.
pub fn verify(message: &[u8], signature_b64: &str, public_key_pem: &str) -> bool {
    let Ok(public) = pem::parse_public_key(public_key_pem) else {
        return false;
    };
    let Ok(raw) = STANDARD.decode(signature_b64.trim()) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(raw.as_slice()) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(public)
        .verify(message, &signature)
        .is_ok()
}
