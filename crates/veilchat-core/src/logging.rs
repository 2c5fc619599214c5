//! Logging helpers that keep sensitive data out of log output.
//!
//! Peer addresses, key material and payloads are wrapped before they
//! reach a `tracing` field.

use std::fmt;

/// Redact a peer address, keeping only its first 6 and last 10 characters.
///
/// Enough survives to tell peers apart in a log; short addresses are
/// hidden entirely.
pub struct RedactedAddress<'a>(pub &'a str);

impl fmt::Display for RedactedAddress<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 20 && s.is_char_boundary(6) && s.is_char_boundary(s.len() - 10) {
            write!(f, "{}...{}", &s[..6], &s[s.len() - 10..])
        } else {
            write!(f, "[REDACTED ADDRESS]")
        }
    }
}

impl fmt::Debug for RedactedAddress<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a byte slice, showing only length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl fmt::Display for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl fmt::Debug for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
