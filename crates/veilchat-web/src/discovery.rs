//! Discovery server API

use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware as axum_middleware,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::error::{ApiResult, ValidJson};
use crate::middleware::{admit, cors, Admission, JSON_BODY_LIMIT};
use crate::models::*;
use veilchat_core::directory::PeerRecord;
use veilchat_core::protocol::{routes, SubscribeRequest, UnsubscribeRequest};

/// Router for the discovery surface
pub fn router(state: Arc<DiscoveryState>) -> Router {
    let subscription_guard = Admission::new(&state.limiter, &state.admission.subscription);
    let peers_guard = Admission::new(&state.limiter, &state.admission.active_peers);

    Router::new()
        .route(
            routes::SUBSCRIBE,
            post(subscribe).layer(axum_middleware::from_fn_with_state(subscription_guard.clone(), admit)),
        )
        .route(
            routes::UNSUBSCRIBE,
            post(unsubscribe).layer(axum_middleware::from_fn_with_state(subscription_guard, admit)),
        )
        .route(
            routes::ACTIVE_PEERS,
            get(active_peers).layer(axum_middleware::from_fn_with_state(peers_guard, admit)),
        )
        .layer(RequestBodyLimitLayer::new(JSON_BODY_LIMIT))
        .layer(cors())
        .with_state(state)
}

/// Register or refresh a peer
pub async fn subscribe(
    State(state): State<Arc<DiscoveryState>>,
    ValidJson(request): ValidJson<SubscribeRequest>,
) -> ApiResult<PeerRecord> {
    let record = state
        .directory
        .subscribe(&request.address, &request.nickname, &request.public_key)
        .await?;
    Ok((StatusCode::OK, Json(ApiResponse::ok(record))))
}

/// Deregister a peer; the signature must match the key on record
pub async fn unsubscribe(
    State(state): State<Arc<DiscoveryState>>,
    ValidJson(request): ValidJson<UnsubscribeRequest>,
) -> ApiResult<Notice> {
    state
        .directory
        .unsubscribe(&request.address, &request.signature)
        .await?;
    Ok((
        StatusCode::OK,
        Json(ApiResponse::ok(Notice::new("Unsubscribed successfully"))),
    ))
}

/// Live peers, optionally only the one at `address`
pub async fn active_peers(
    State(state): State<Arc<DiscoveryState>>,
    Query(query): Query<PeersQuery>,
) -> ApiResult<Vec<PeerRecord>> {
    let peers = state.directory.query(query.address.as_deref()).await;
    Ok((StatusCode::OK, Json(ApiResponse::ok(peers))))
}
