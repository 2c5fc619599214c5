//! Session registry.
//!
//! Maps a counterpart address to its channel and message history. At most
//! one entry exists per address; creation is insert-if-absent under the
//! write lock, which is what makes concurrent establishes exclusive.
//!
//! The registry also tracks which addresses have a local initiate in
//! flight, so that a crossing inbound handshake can be resolved under the
//! same write lock that would store it.

use super::message::Message;
use crate::crypto::SecureChannel;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Per-address session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No session. Also the state after a close.
    NoSession,
    /// Channel established, messages may flow.
    Established,
}

/// Registry entry for one counterpart.
#[derive(Debug)]
pub struct SessionEntry {
    /// Channel, shared with in-flight operations.
    pub channel: Arc<SecureChannel>,
    /// History, oldest first.
    pub messages: Vec<Message>,
    /// When the session was established.
    pub established_at: DateTime<Utc>,
}

impl SessionEntry {
    fn new(channel: Arc<SecureChannel>) -> Self {
        Self {
            channel,
            messages: Vec::new(),
            established_at: Utc::now(),
        }
    }
}

/// Summary of an established session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Counterpart address.
    pub address: String,
    /// Counterpart nickname.
    pub nickname: String,
    /// When the session was established.
    pub established_at: DateTime<Utc>,
    /// Number of messages in the history.
    pub message_count: usize,
}

/// Shared session map. Cloning yields another handle to the same map.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    initiating: Arc<std::sync::Mutex<HashSet<String>>>,
}

/// What happened to an inbound session offered to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboundOutcome {
    /// Stored as the session for its address.
    Inserted,
    /// A session already existed and was kept.
    Existing,
    /// Dropped in favour of the local initiate in flight.
    Deferred,
}

/// Marks a local initiate as in flight until dropped.
#[derive(Debug)]
pub(crate) struct InitiateGuard {
    initiating: Arc<std::sync::Mutex<HashSet<String>>>,
    address: String,
}

impl Drop for InitiateGuard {
    fn drop(&mut self) {
        in_flight(&self.initiating).remove(&self.address);
    }
}

fn in_flight(set: &std::sync::Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    // The set stays consistent even if a holder panicked.
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// State of the session with `address`.
    pub async fn state(&self, address: &str) -> SessionState {
        if self.sessions.read().await.contains_key(address) {
            SessionState::Established
        } else {
            SessionState::NoSession
        }
    }

    /// Channel of the session with `address`.
    pub async fn channel(&self, address: &str) -> Option<Arc<SecureChannel>> {
        self.sessions
            .read()
            .await
            .get(address)
            .map(|entry| Arc::clone(&entry.channel))
    }

    /// Store a new session unless one exists. Returns whether it was stored.
    pub async fn insert_if_absent(&self, address: &str, channel: Arc<SecureChannel>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(address) {
            return false;
        }
        sessions.insert(address.to_string(), SessionEntry::new(channel));
        true
    }

    /// Record a local initiate towards `address` as in flight.
    ///
    /// Returns `None` if a session already exists. The mark is cleared
    /// when the guard drops.
    pub(crate) async fn begin_initiate(&self, address: &str) -> Option<InitiateGuard> {
        let sessions = self.sessions.read().await;
        if sessions.contains_key(address) {
            return None;
        }
        in_flight(&self.initiating).insert(address.to_string());
        Some(InitiateGuard {
            initiating: Arc::clone(&self.initiating),
            address: address.to_string(),
        })
    }

    /// Store a session created by an inbound handshake.
    ///
    /// With `defer_to_initiate`, the session is not stored while a local
    /// initiate towards the same address is in flight.
    pub(crate) async fn insert_inbound(
        &self,
        address: &str,
        channel: Arc<SecureChannel>,
        defer_to_initiate: bool,
    ) -> InboundOutcome {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(address) {
            return InboundOutcome::Existing;
        }
        if defer_to_initiate && in_flight(&self.initiating).contains(address) {
            return InboundOutcome::Deferred;
        }
        sessions.insert(address.to_string(), SessionEntry::new(channel));
        InboundOutcome::Inserted
    }

    /// Remove the session with `address`.
    pub async fn remove(&self, address: &str) -> Option<SessionEntry> {
        self.sessions.write().await.remove(address)
    }

    /// Remove the session only if it still holds `channel`.
    pub async fn remove_if_same(&self, address: &str, channel: &Arc<SecureChannel>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(address) {
            Some(entry) if Arc::ptr_eq(&entry.channel, channel) => {
                sessions.remove(address);
                true
            }
            _ => false,
        }
    }

    /// Append to the history only if the session still holds `channel`.
    pub async fn append_if_same(&self, address: &str, channel: &Arc<SecureChannel>, message: Message) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(address) {
            Some(entry) if Arc::ptr_eq(&entry.channel, channel) => {
                entry.messages.push(message);
                true
            }
            _ => false,
        }
    }

    /// Copy of the history of the session with `address`.
    pub async fn messages(&self, address: &str) -> Option<Vec<Message>> {
        self.sessions
            .read()
            .await
            .get(address)
            .map(|entry| entry.messages.clone())
    }

    /// Summaries of all sessions, sorted by address.
    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(address, entry)| SessionSummary {
                address: address.clone(),
                nickname: entry.channel.counterpart_nickname().to_string(),
                established_at: entry.established_at,
                message_count: entry.messages.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.address.cmp(&b.address));
        summaries
    }

    /// Number of sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether there are no sessions.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop every session.
    pub async fn clear(&self) {
        self.sessions.write().await.clear();
    }
}

/// Async mutexes keyed by address.
#[derive(Debug, Clone, Default)]
pub(crate) struct KeyedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl KeyedLocks {
    /// Acquire the lock for `key`, waiting for any current holder.
    pub(crate) async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Idle locks are only referenced by the map.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}
