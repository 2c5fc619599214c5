//! Peer-to-peer API
//!
//! The routes counterparts call through the anonymizing transport. Every
//! body is signed by the caller except download-file, whose capability is
//! knowledge of the blob id.

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use crate::error::{ApiError, ApiResult, ValidJson};
use crate::middleware::{admit, security_headers, Admission, JSON_BODY_LIMIT};
use crate::models::*;
use veilchat_core::content::sanitize_filename;
use veilchat_core::messaging::{CloseOutcome, EstablishOutcome};
use veilchat_core::protocol::{
    routes, CloseSessionRequest, FetchFileRequest, SignedEnvelope, StartSessionRequest,
};

/// Router for the public peer surface
pub fn router(state: Arc<PeerState>) -> Router {
    let policies = &state.config.admission;
    let limiter = &state.limiter;
    let session_guard = Admission::new(limiter, &policies.session);

    Router::new()
        .route(
            routes::START_SESSION,
            post(start_session).layer(axum_middleware::from_fn_with_state(session_guard.clone(), admit)),
        )
        .route(
            routes::CLOSE_SESSION,
            post(close_session).layer(axum_middleware::from_fn_with_state(session_guard, admit)),
        )
        .route(
            routes::SEND_MESSAGE,
            post(send_message).layer(axum_middleware::from_fn_with_state(
                Admission::new(limiter, &policies.send_message),
                admit,
            )),
        )
        .route(
            routes::DOWNLOAD_FILE,
            post(download_file).layer(axum_middleware::from_fn_with_state(
                Admission::new(limiter, &policies.download_file),
                admit,
            )),
        )
        .layer(RequestBodyLimitLayer::new(JSON_BODY_LIMIT))
        .layer(axum_middleware::from_fn(security_headers))
        .with_state(state)
}

/// Accept a handshake
pub async fn start_session(
    State(state): State<Arc<PeerState>>,
    ValidJson(request): ValidJson<StartSessionRequest>,
) -> ApiResult<Notice> {
    let address = request.payload.sender_address.clone();
    let notice = match state.protocol.accept_incoming(&request).await? {
        EstablishOutcome::Established => format!("Session started with {}", address),
        EstablishOutcome::AlreadyEstablished => format!("Session already active with {}", address),
    };
    Ok((StatusCode::OK, Json(ApiResponse::ok(Notice::new(notice)))))
}

/// Accept a close notification
pub async fn close_session(
    State(state): State<Arc<PeerState>>,
    ValidJson(request): ValidJson<CloseSessionRequest>,
) -> ApiResult<Notice> {
    let notice = match state.protocol.accept_close(&request).await? {
        CloseOutcome::NoSession => format!(
            "Session already closed or never existed with {}",
            request.sender_address
        ),
        _ => format!("Session closed with {}", request.sender_address),
    };
    Ok((StatusCode::OK, Json(ApiResponse::ok(Notice::new(notice)))))
}

/// Receive an encrypted message
pub async fn send_message(
    State(state): State<Arc<PeerState>>,
    ValidJson(signed): ValidJson<SignedEnvelope>,
) -> ApiResult<Notice> {
    state.protocol.receive_message(&signed).await?;
    Ok((
        StatusCode::OK,
        Json(ApiResponse::ok(Notice::new(format!(
            "Message received from {}",
            signed.envelope.sender_address
        )))),
    ))
}

/// Serve a cached blob
pub async fn download_file(
    State(state): State<Arc<PeerState>>,
    ValidJson(request): ValidJson<FetchFileRequest>,
) -> Result<Response, ApiError> {
    if request.file_id.trim().is_empty() {
        return Err(veilchat_core::Error::Validation("fileId is required".into()).into());
    }
    let blob = state.content.get(&request.file_id).await?;
    info!(id = %blob.id, size = blob.bytes.len(), "Serving file");

    let content_type = HeaderValue::from_str(&blob.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        sanitize_filename(&blob.original_name)
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        blob.bytes.to_vec(),
    )
        .into_response())
}
