//! Request middleware: admission control, security headers, CORS.

use crate::error::ApiError;
use axum::{
    body::{self, Body},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use veilchat_core::admission::{RateLimiter, RoutePolicy};
use veilchat_core::Error;

/// Default body limit for JSON routes (1MB)
pub const JSON_BODY_LIMIT: usize = 1024 * 1024;

/// Body limit for file uploads (64MB)
pub const UPLOAD_BODY_LIMIT: usize = veilchat_core::config::DEFAULT_MAX_FILE_BYTES;

/// State of one admission guard: the shared counters and the route's policy.
#[derive(Clone)]
pub struct Admission {
    limiter: RateLimiter,
    policy: RoutePolicy,
}

impl Admission {
    pub fn new(limiter: &RateLimiter, policy: &RoutePolicy) -> Self {
        Self {
            limiter: limiter.clone(),
            policy: policy.clone(),
        }
    }
}

fn origin(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Admission control middleware
///
/// Keys the request on the policy's JSON body field when present, else on
/// the peer IP, and rejects it with 429 before the handler runs.
pub async fn admit(State(admission): State<Admission>, request: Request, next: Next) -> Response {
    let origin = origin(&request);

    let (key, request) = match admission.policy.key_field {
        Some(field) => {
            let (parts, body) = request.into_parts();
            let bytes = match body::to_bytes(body, JSON_BODY_LIMIT).await {
                Ok(bytes) => bytes,
                Err(_) => {
                    return ApiError(Error::Validation("request body too large or unreadable".into()))
                        .into_response()
                }
            };
            let declared = serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|value| value.get(field)?.as_str().map(str::to_string))
                .filter(|value| !value.is_empty());
            (
                declared.unwrap_or(origin),
                Request::from_parts(parts, Body::from(bytes)),
            )
        }
        None => (origin, request),
    };

    match admission.limiter.check(&admission.policy, &key).await {
        Ok(()) => next.run(request).await,
        Err(e) => ApiError(e).into_response(),
    }
}

/// Security headers middleware
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));

    response
}

/// Permissive CORS for the discovery and local surfaces
pub fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600))
}
