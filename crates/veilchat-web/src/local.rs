//! Local control API
//!
//! Bound to localhost for the trusted local caller. Plaintext goes in and
//! out here; key material never does, apart from this node's public key.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult, ValidJson};
use crate::middleware::{cors, JSON_BODY_LIMIT, UPLOAD_BODY_LIMIT};
use crate::models::*;
use veilchat_core::content::{sanitize_filename, BlobMetadata, CachedBlob};
use veilchat_core::directory::PeerRecord;
use veilchat_core::messaging::{CloseOutcome, EstablishOutcome, Message, SessionSummary};
use veilchat_core::protocol::{SubscribeRequest, UnsubscribeRequest};
use veilchat_core::Error;

/// Router for the local control surface
pub fn router(state: Arc<PeerState>) -> Router {
    let uploads = Router::new()
        .route("/local/files", post(upload_file).get(list_files))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(UPLOAD_BODY_LIMIT));

    let commands = Router::new()
        .route("/local/configurations", get(configurations))
        .route("/local/subscribe", post(subscribe))
        .route("/local/unsubscribe", post(unsubscribe))
        .route("/local/active-peers", get(active_peers))
        .route("/local/sessions", get(sessions))
        .route("/local/start-session", post(start_session))
        .route("/local/close-session", post(close_session))
        .route("/local/send-message", post(send_message))
        .route("/local/get-messages", get(get_messages))
        .route("/local/files/:file_id", delete(delete_file))
        .route("/local/download-file", post(download_file))
        .route("/local/reset", post(reset))
        .route("/local/shutdown", post(shutdown))
        .layer(RequestBodyLimitLayer::new(JSON_BODY_LIMIT));

    Router::new()
        .merge(uploads)
        .merge(commands)
        .layer(cors())
        .with_state(state)
}

fn ok<T>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::ok(data))))
}

fn required(field: &str, value: Option<&str>) -> Result<String, ApiError> {
    match value.map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(Error::Validation(format!("{} is required", field)).into()),
    }
}

/// This node's address, keys and discovery server
pub async fn configurations(State(state): State<Arc<PeerState>>) -> ApiResult<Configuration> {
    let identity = state.protocol.identity();
    ok(Configuration {
        address: state.config.public_address.clone(),
        nickname: state.config.nickname.clone(),
        public_key: identity.public_key()?,
        fingerprint: identity.fingerprint()?,
        discovery_server_url: state.config.discovery_address.clone(),
    })
}

/// Register this node with the discovery server
pub async fn subscribe(State(state): State<Arc<PeerState>>) -> ApiResult<Notice> {
    let request = SubscribeRequest {
        address: state.config.public_address.clone(),
        nickname: state.config.nickname.clone(),
        public_key: state.protocol.identity().public_key()?,
    };
    state
        .discovery
        .subscribe(&state.config.discovery_address, &request)
        .await?;
    info!("Subscribed with discovery server");
    ok(Notice::new("Subscribed successfully"))
}

async fn signed_unsubscribe(state: &PeerState) -> veilchat_core::Result<()> {
    let address = state.config.public_address.clone();
    let signature = state.protocol.identity().sign(address.as_bytes())?;
    state
        .discovery
        .unsubscribe(
            &state.config.discovery_address,
            &UnsubscribeRequest { address, signature },
        )
        .await
}

/// Deregister this node
pub async fn unsubscribe(State(state): State<Arc<PeerState>>) -> ApiResult<Notice> {
    signed_unsubscribe(&state).await?;
    info!("Unsubscribed from discovery server");
    ok(Notice::new("Unsubscribed successfully"))
}

/// Live peers known to the discovery server
pub async fn active_peers(
    State(state): State<Arc<PeerState>>,
    Query(query): Query<PeersQuery>,
) -> ApiResult<Vec<PeerRecord>> {
    let filter = query.address.as_deref().filter(|a| !a.is_empty());
    let peers = state
        .discovery
        .active_peers(&state.config.discovery_address, filter)
        .await?;
    ok(peers)
}

/// Established sessions
pub async fn sessions(State(state): State<Arc<PeerState>>) -> ApiResult<Vec<SessionSummary>> {
    ok(state.protocol.active_sessions().await)
}

/// Open a session with a counterpart
pub async fn start_session(
    State(state): State<Arc<PeerState>>,
    ValidJson(command): ValidJson<StartSessionCommand>,
) -> ApiResult<StartSessionResult> {
    let address = command.destination_address;
    let outcome = state
        .protocol
        .initiate(&address, &command.destination_public_key, &command.destination_nickname)
        .await?;
    let (message, newly_established) = match outcome {
        EstablishOutcome::Established => (format!("Session established with {}", address), true),
        EstablishOutcome::AlreadyEstablished => (format!("Session already active with {}", address), false),
    };
    ok(StartSessionResult {
        message,
        newly_established,
    })
}

/// Close a session; 207 when the counterpart did not confirm
pub async fn close_session(
    State(state): State<Arc<PeerState>>,
    ValidJson(command): ValidJson<CloseSessionCommand>,
) -> ApiResult<Notice> {
    let address = command.destination_address;
    match state.protocol.close_session(&address).await? {
        CloseOutcome::NoSession => ok(Notice::new(format!(
            "Session already closed or never existed with {}",
            address
        ))),
        CloseOutcome::Closed => ok(Notice::new(format!("Session closed successfully with {}", address))),
        CloseOutcome::ClosedLocally { reason } => {
            let partial = Error::PartialFailure(reason);
            let status = StatusCode::from_u16(partial.http_status()).unwrap_or(StatusCode::MULTI_STATUS);
            Ok((
                status,
                Json(ApiResponse {
                    success: true,
                    data: Some(Notice::new(format!(
                        "Session closed locally, but the remote peer {} did not confirm",
                        address
                    ))),
                    error: Some(partial.to_string()),
                }),
            ))
        }
    }
}

/// Send a message on an established session
pub async fn send_message(
    State(state): State<Arc<PeerState>>,
    ValidJson(command): ValidJson<SendMessageCommand>,
) -> ApiResult<Notice> {
    state
        .protocol
        .send_message(&command.destination_address, &command.message)
        .await?;
    ok(Notice::new(format!("Message sent to {}", command.destination_address)))
}

/// History of a session
pub async fn get_messages(
    State(state): State<Arc<PeerState>>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Vec<Message>> {
    let address = required("destinationAddress", query.destination_address.as_deref())?;
    ok(state.protocol.fetch_messages(&address).await?)
}

/// Publish a file for counterparts to fetch
pub async fn upload_file(
    State(state): State<Arc<PeerState>>,
    mut multipart: Multipart,
) -> ApiResult<UploadedFile> {
    let mut upload: Option<(Vec<u8>, BlobMetadata)> = None;
    let mut ttl = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(e.body_text()))?
    {
        match field.name() {
            Some("file") => {
                let metadata = BlobMetadata {
                    content_type: field.content_type().map(str::to_string),
                    original_name: field.file_name().map(str::to_string),
                };
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::Validation(e.body_text()))?;
                upload = Some((bytes.to_vec(), metadata));
            }
            Some("ttl") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::Validation(e.body_text()))?;
                // Unparsable or non-positive values fall back to the default.
                ttl = text.trim().parse::<u64>().ok();
            }
            _ => {}
        }
    }

    let (bytes, metadata) = upload.ok_or_else(|| Error::Validation("file is required".into()))?;
    let file_id = state.content.put(bytes, metadata, ttl).await?;
    let blob = state.content.get(&file_id).await?;
    ok(UploadedFile {
        file_id,
        expires_at: blob.expires_at,
    })
}

/// Files currently offered
pub async fn list_files(State(state): State<Arc<PeerState>>) -> ApiResult<Vec<CachedBlob>> {
    ok(state.content.list().await)
}

/// Withdraw a file
pub async fn delete_file(
    State(state): State<Arc<PeerState>>,
    Path(file_id): Path<String>,
) -> ApiResult<DeletedFile> {
    if !state.content.delete(&file_id).await {
        return Err(Error::NotFound(format!("file {}", file_id)).into());
    }
    ok(DeletedFile { deleted: true })
}

/// Fetch a file from a counterpart and write it under `downloadPath`
pub async fn download_file(
    State(state): State<Arc<PeerState>>,
    ValidJson(command): ValidJson<DownloadFileCommand>,
) -> ApiResult<DownloadedFile> {
    let directory = required("downloadPath", Some(command.download_path.as_str()))?;
    let file = state
        .protocol
        .fetch_file(&command.destination_address, &command.file_id)
        .await?;

    // Only the base name of the counterpart's suggestion is used.
    let suggested = file
        .file_name
        .as_deref()
        .and_then(|name| std::path::Path::new(name).file_name())
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("downloaded_file_{}", command.file_id));
    let path = PathBuf::from(directory).join(sanitize_filename(&suggested));

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(Error::from)?;
    }
    tokio::fs::write(&path, &file.bytes).await.map_err(Error::from)?;
    info!(
        size = file.bytes.len(),
        content_type = file.content_type.as_deref().unwrap_or("unknown"),
        "File downloaded"
    );

    ok(DownloadedFile {
        path: path.display().to_string(),
        size: file.bytes.len(),
        content_type: file.content_type,
    })
}

/// Rotate identity and drop every session and cached file
pub async fn reset(State(state): State<Arc<PeerState>>) -> ApiResult<Notice> {
    if let Err(e) = signed_unsubscribe(&state).await {
        warn!(error = %e, "Unsubscribe during reset failed");
    }
    state.protocol.reset_identity().await?;
    state.content.clear().await;
    info!("Local state reset");
    ok(Notice::new("Reset keys and local state"))
}

/// Deregister and stop the node
pub async fn shutdown(State(state): State<Arc<PeerState>>) -> ApiResult<Notice> {
    if let Err(e) = signed_unsubscribe(&state).await {
        warn!(error = %e, "Unsubscribe during shutdown failed");
    }
    info!("Shutdown requested");
    state.shutdown.send_replace(true);
    ok(Notice::new("Peer shutting down"))
}
