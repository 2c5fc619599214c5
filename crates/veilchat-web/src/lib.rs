//! HTTP surfaces for veilchat.
//!
//! - [`api`]: the peer-to-peer routes counterparts call
//! - [`local`]: the localhost control routes for the node's owner
//! - [`discovery`]: the discovery server routes

pub mod api;
pub mod discovery;
pub mod error;
pub mod local;
pub mod middleware;
pub mod models;

use tokio::sync::watch;

/// Resolve once `shutdown` flips to `true` or its sender is dropped.
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
