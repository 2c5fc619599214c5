//! Message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message in a session's history. Appended once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Who wrote it: the local address for sent messages, the
    /// counterpart's for received ones.
    pub sender_label: String,
    /// Decrypted body.
    pub plaintext: String,
    /// When it entered the history.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message stamped now.
    pub fn new(sender_label: impl Into<String>, plaintext: impl Into<String>) -> Self {
        Self {
            sender_label: sender_label.into(),
            plaintext: plaintext.into(),
            timestamp: Utc::now(),
        }
    }
}
