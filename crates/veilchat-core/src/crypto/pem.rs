//! Public key PEM handling.
//!
//! Peers exchange SubjectPublicKeyInfo PEM strings that pass through
//! JSON bodies, form fields and directory records, so line breaks and
//! spacing drift. Every key is normalised before it is parsed or stored.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};

/// Standard SPKI PEM header.
pub const PUBLIC_KEY_HEADER: &str = "-----BEGIN PUBLIC KEY-----";

/// Standard SPKI PEM footer.
pub const PUBLIC_KEY_FOOTER: &str = "-----END PUBLIC KEY-----";

/// Base64 line width of the PEM body.
const PEM_LINE_WIDTH: usize = 64;

/// Extract the base64 body of a public key PEM, with all whitespace and
/// the header/footer removed.
fn pem_body(raw: &str) -> String {
    let stripped: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let header: String = PUBLIC_KEY_HEADER.chars().filter(|c| !c.is_whitespace()).collect();
    let footer: String = PUBLIC_KEY_FOOTER.chars().filter(|c| !c.is_whitespace()).collect();
    stripped.replace(&header, "").replace(&footer, "")
}

/// Normalise a public key PEM: strip whitespace, then re-wrap the body
/// under the standard header and footer.
///
/// The result is stable: normalising an already normalised key returns
/// it unchanged.
pub fn normalize_public_key_pem(raw: &str) -> String {
    let body = pem_body(raw);
    let lines: Vec<String> = body
        .as_bytes()
        .chunks(PEM_LINE_WIDTH)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();
    format!("{}\n{}\n{}", PUBLIC_KEY_HEADER, lines.join("\n"), PUBLIC_KEY_FOOTER)
}

/// Parse a public key PEM, tolerating formatting differences.
pub fn parse_public_key(raw: &str) -> Result<RsaPublicKey> {
    let der = STANDARD
        .decode(pem_body(raw))
        .map_err(|_| Error::InvalidKey("public key is not valid base64".into()))?;
    RsaPublicKey::from_public_key_der(&der)
        .map_err(|_| Error::InvalidKey("public key is not a valid SPKI RSA key".into()))
}

/// Encode a public key as normalised PEM.
pub fn encode_public_key(key: &RsaPublicKey) -> Result<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    let body = STANDARD.encode(der.as_bytes());
    Ok(normalize_public_key_pem(&body))
}

/// SHA-256 fingerprint of a public key's DER encoding, hex encoded.
pub fn fingerprint(key: &RsaPublicKey) -> Result<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(der.as_bytes())))
}
