//! Admission control.
//!
//! Fixed-window request counters, one [`RoutePolicy`] per sensitive
//! route. A request is counted against the caller's declared identity
//! field when the policy names one and the request carries it, else
//! against its network origin. Requests over budget are rejected with
//! [`Error::RateLimited`] before any handler runs.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Counters are purged of expired windows once the table grows past this.
const PURGE_THRESHOLD: usize = 10_000;

/// Budget for one route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
    /// Policy name; counters are kept per policy.
    pub name: &'static str,
    /// Requests admitted per window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
    /// JSON body field identifying the caller, if any.
    pub key_field: Option<&'static str>,
}

impl RoutePolicy {
    /// A policy keyed on network origin.
    pub fn new(name: &'static str, max_requests: u32, window: Duration) -> Self {
        Self {
            name,
            max_requests,
            window,
            key_field: None,
        }
    }

    /// Key the policy on a JSON body field instead of the origin.
    pub fn keyed_by(mut self, field: &'static str) -> Self {
        self.key_field = Some(field);
        self
    }
}

#[derive(Debug)]
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

/// Shared counter table. Cloning yields another handle to the same table.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    entries: Arc<Mutex<HashMap<(&'static str, String), RateLimitEntry>>>,
}

impl RateLimiter {
    /// Create an empty limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request by `key` against `policy`.
    pub async fn check(&self, policy: &RoutePolicy, key: &str) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if entries.len() > PURGE_THRESHOLD {
            entries.retain(|(name, _), entry| {
                // Policies share one table; keep anything we can't age out.
                *name != policy.name || now.duration_since(entry.window_start) < policy.window
            });
        }

        let entry = entries
            .entry((policy.name, key.to_string()))
            .or_insert(RateLimitEntry {
                count: 0,
                window_start: now,
            });

        let elapsed = now.duration_since(entry.window_start);
        if elapsed >= policy.window {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= policy.max_requests {
            let retry_after = policy.window.saturating_sub(now.duration_since(entry.window_start));
            debug!(policy = policy.name, "Request rejected by admission control");
            return Err(Error::RateLimited { retry_after });
        }

        entry.count += 1;
        Ok(())
    }
}
