//! Peer directory for the discovery server.
//!
//! One [`PeerRecord`] per address, each expiring after the configured TTL
//! unless the peer subscribes again. Unsubscribing requires a signature
//! over the address by the key currently on record.

use crate::crypto::pem;
use crate::error::{Error, Result};
use crate::identity;
use crate::logging::RedactedAddress;
use crate::store::TtlStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// A registered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    /// Address the peer is reachable under.
    pub address: String,
    /// Self-chosen nickname.
    pub nickname: String,
    /// Public key, normalised PEM.
    pub public_key: String,
    /// First registration time of the current record.
    pub registered_at: DateTime<Utc>,
    /// When the record stops being visible unless refreshed.
    pub expires_at: DateTime<Utc>,
}

/// TTL-keyed presence registry.
#[derive(Clone)]
pub struct PeerDirectory {
    records: TtlStore<PeerRecord>,
    ttl: Duration,
}

impl PeerDirectory {
    /// Create an empty directory whose records live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: TtlStore::new("peer-directory"),
            ttl,
        }
    }

    /// Insert or refresh a registration.
    ///
    /// Re-subscribing an address replaces nickname and key and resets the
    /// expiry; `registered_at` survives the refresh.
    pub async fn subscribe(&self, address: &str, nickname: &str, public_key: &str) -> Result<PeerRecord> {
        require("address", address)?;
        require("nickname", nickname)?;
        require("publicKey", public_key)?;
        pem::parse_public_key(public_key)?;

        let public_key = pem::normalize_public_key_pem(public_key);
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| Error::Internal("peer ttl out of range".into()))?;

        let record = self
            .records
            .upsert_with(address, self.ttl, |existing| PeerRecord {
                address: address.to_string(),
                nickname: nickname.to_string(),
                public_key,
                registered_at: existing.map_or(now, |r| r.registered_at),
                expires_at,
            })
            .await;

        info!(address = %RedactedAddress(address), "Peer subscribed");
        Ok(record)
    }

    /// Remove a registration after checking `signature` (base64, over the
    /// address bytes) against the stored key.
    pub async fn unsubscribe(&self, address: &str, signature: &str) -> Result<()> {
        require("address", address)?;
        require("signature", signature)?;

        let removed = self
            .records
            .remove_if(address, |record| {
                identity::verify(address.as_bytes(), signature, &record.public_key)
            })
            .await;

        match removed {
            None => Err(Error::NotFound(format!("peer {}", RedactedAddress(address)))),
            Some(false) => Err(Error::Authentication),
            Some(true) => {
                info!(address = %RedactedAddress(address), "Peer unsubscribed");
                Ok(())
            }
        }
    }

    /// Live records: the one matching `address`, or all of them.
    pub async fn query(&self, address: Option<&str>) -> Vec<PeerRecord> {
        match address.filter(|a| !a.is_empty()) {
            Some(address) => self.records.get(address).await.into_iter().collect(),
            None => {
                let mut records = self.records.values().await;
                records.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
                records
            }
        }
    }

    /// Start the periodic expiry sweep.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        self.records.spawn_sweeper(period)
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityService;

    const TEST_BITS: usize = 1024;

    #[tokio::test]
    async fn test_subscribe_query_unsubscribe() {
        let directory = PeerDirectory::new(Duration::from_secs(3600));
        let alice = IdentityService::new(TEST_BITS).expect("identity");
        let other = IdentityService::new(TEST_BITS).expect("identity");
        let pk_a = alice.public_key().expect("pk");

        directory.subscribe("peerA", "Alice", &pk_a).await.expect("subscribe");

        let peers = directory.query(None).await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, "peerA");
        assert_eq!(peers[0].nickname, "Alice");
        assert_eq!(peers[0].public_key, pk_a);

        let forged = other.sign(b"peerA").expect("sign");
        assert!(matches!(
            directory.unsubscribe("peerA", &forged).await,
            Err(Error::Authentication)
        ));
        assert_eq!(directory.query(None).await.len(), 1);

        let genuine = alice.sign(b"peerA").expect("sign");
        directory.unsubscribe("peerA", &genuine).await.expect("unsubscribe");
        assert!(directory.query(None).await.is_empty());

        assert!(matches!(
            directory.unsubscribe("peerA", &genuine).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resubscribe_is_upsert() {
        let directory = PeerDirectory::new(Duration::from_secs(3600));
        let alice = IdentityService::new(TEST_BITS).expect("identity");
        let pk = alice.public_key().expect("pk");

        let first = directory.subscribe("peerA", "Alice", &pk).await.expect("subscribe");
        let second = directory.subscribe("peerA", "Alicia", &pk).await.expect("subscribe");

        assert_eq!(directory.query(None).await.len(), 1);
        assert_eq!(second.nickname, "Alicia");
        assert_eq!(second.registered_at, first.registered_at);
        assert!(second.expires_at >= first.expires_at);
    }

    #[tokio::test]
    async fn test_query_by_address() {
        let directory = PeerDirectory::new(Duration::from_secs(3600));
        let pk = IdentityService::new(TEST_BITS)
            .expect("identity")
            .public_key()
            .expect("pk");
        directory.subscribe("peerA", "Alice", &pk).await.expect("subscribe");
        directory.subscribe("peerB", "Bob", &pk).await.expect("subscribe");

        let only_b = directory.query(Some("peerB")).await;
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].nickname, "Bob");
        assert!(directory.query(Some("peerC")).await.is_empty());
        assert_eq!(directory.query(Some("")).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expires() {
        let directory = PeerDirectory::new(Duration::from_secs(1));
        let pk = IdentityService::new(TEST_BITS)
            .expect("identity")
            .public_key()
            .expect("pk");
        directory.subscribe("peerA", "Alice", &pk).await.expect("subscribe");
        assert_eq!(directory.query(Some("peerA")).await.len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(directory.query(Some("peerA")).await.is_empty());
        assert!(directory.query(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_is_an_error() {
        let pk = IdentityService::new(TEST_BITS)
            .expect("identity")
            .public_key()
            .expect("pk");

        // Representable as a chrono duration, but past the last date.
        let far = PeerDirectory::new(Duration::from_secs(1_000_000_000_000_000));
        assert!(matches!(
            far.subscribe("peerA", "Alice", &pk).await,
            Err(Error::Internal(_))
        ));
        let huge = PeerDirectory::new(Duration::MAX);
        assert!(matches!(
            huge.subscribe("peerA", "Alice", &pk).await,
            Err(Error::Internal(_))
        ));
        assert!(far.query(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_validation() {
        let directory = PeerDirectory::new(Duration::from_secs(60));
        assert!(matches!(
            directory.subscribe("", "Alice", "key").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            directory.subscribe("peerA", "Alice", "not a key").await,
            Err(Error::InvalidKey(_))
        ));
    }
}
