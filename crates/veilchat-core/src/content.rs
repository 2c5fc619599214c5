//! Ephemeral content store for file transfer payloads.
//!
//! Peers publish a blob locally and hand its id to a counterpart, who
//! fetches the bytes over the peer-to-peer API before the blob expires.

use crate::error::{Error, Result};
use crate::store::TtlStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Lifetime used when the caller gives none (seconds).
pub const DEFAULT_BLOB_TTL_SECS: u64 = 1800;

/// Longest lifetime a blob may be given (seconds).
pub const MAX_BLOB_TTL_SECS: u64 = 86_400;

/// Content type assumed when the uploader sends none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Descriptive metadata supplied with a blob.
#[derive(Debug, Clone, Default)]
pub struct BlobMetadata {
    /// MIME type.
    pub content_type: Option<String>,
    /// Name of the uploaded file.
    pub original_name: Option<String>,
}

/// A stored blob.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedBlob {
    /// Opaque id.
    pub id: String,
    /// Payload. Shared so reads don't copy it.
    #[serde(skip)]
    pub bytes: Arc<Vec<u8>>,
    /// MIME type.
    pub content_type: String,
    /// Name of the uploaded file.
    pub original_name: String,
    /// Upload time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
}

/// Clamp a requested TTL: missing or zero picks the default, anything
/// above the cap is cut to it.
pub fn effective_ttl(ttl_secs: Option<u64>) -> Duration {
    let secs = match ttl_secs {
        None | Some(0) => DEFAULT_BLOB_TTL_SECS,
        Some(secs) => secs.min(MAX_BLOB_TTL_SECS),
    };
    Duration::from_secs(secs)
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`, for header
/// and file system use.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match sanitized.trim_matches('.') {
        "" => "file".to_string(),
        _ => sanitized,
    }
}

/// TTL blob store, sole owner of the cached bytes.
#[derive(Clone)]
pub struct ContentStore {
    blobs: TtlStore<CachedBlob>,
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            blobs: TtlStore::new("content-store"),
        }
    }

    /// Store a blob and return its fresh id.
    pub async fn put(&self, bytes: Vec<u8>, metadata: BlobMetadata, ttl_secs: Option<u64>) -> Result<String> {
        let ttl = effective_ttl(ttl_secs);
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .ok_or_else(|| Error::Internal("blob ttl out of range".into()))?;

        let size = bytes.len();
        let blob = CachedBlob {
            id: id.clone(),
            bytes: Arc::new(bytes),
            content_type: metadata
                .content_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            original_name: metadata
                .original_name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| id.clone()),
            created_at,
            expires_at,
        };
        self.blobs.insert(id.clone(), blob, ttl).await;

        info!(id = %id, size, ttl_secs = ttl.as_secs(), "Blob stored");
        Ok(id)
    }

    /// Fetch a live blob.
    pub async fn get(&self, id: &str) -> Result<CachedBlob> {
        self.blobs
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("file {}", id)))
    }

    /// Remove a blob. Returns whether anything was removed.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.blobs.remove(id).await;
        debug!(id = %id, removed, "Blob delete");
        removed
    }

    /// Ids of all live blobs.
    pub async fn list_ids(&self) -> Vec<String> {
        let mut ids = self.blobs.keys().await;
        ids.sort();
        ids
    }

    /// Metadata of all live blobs, oldest first.
    pub async fn list(&self) -> Vec<CachedBlob> {
        let mut blobs = self.blobs.values().await;
        blobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        blobs
    }

    /// Remove every blob.
    pub async fn clear(&self) {
        self.blobs.clear().await;
    }

    /// Start the periodic expiry sweep.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        self.blobs.spawn_sweeper(period)
    }
}
