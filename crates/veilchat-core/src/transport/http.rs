//! HTTP transport over an optional SOCKS5 proxy.

use super::{DiscoveryTransport, PeerTransport};
use crate::config::TransportConfig;
use crate::directory::PeerRecord;
use crate::error::{Error, Result};
use crate::logging::{RedactedAddress, RedactedBytes};
use crate::protocol::{
    routes, CloseSessionRequest, FetchFileRequest, RemoteFile, SignedEnvelope, StartSessionRequest,
    SubscribeRequest, UnsubscribeRequest,
};
use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Client, Proxy, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Response envelope every JSON endpoint answers with.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    error: Option<String>,
}

/// `reqwest`-backed transport for peers and discovery.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    max_file_bytes: usize,
}

impl HttpTransport {
    /// Build a client routing every request through the configured proxy.
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(config.timeout);
        if let Some(proxy) = &config.socks_proxy {
            let proxy = Proxy::all(proxy.as_str())
                .map_err(|e| Error::Validation(format!("invalid proxy url: {}", e)))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            max_file_bytes: config.max_file_bytes,
        })
    }

    async fn post_json<B: Serialize + ?Sized>(&self, address: &str, path: &str, body: &B) -> Result<Response> {
        let url = endpoint(address, path);
        debug!(to = %RedactedAddress(address), path, "Outbound POST");
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| map_send_error(address, e))?;
        check_status(response).await
    }
}

/// Join an address and a path, defaulting the scheme to plain HTTP.
fn endpoint(address: &str, path: &str) -> String {
    let base = address.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{}{}", base, path)
    } else {
        format!("http://{}{}", base, path)
    }
}

fn map_send_error(address: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        warn!(to = %RedactedAddress(address), "Outbound request timed out");
        Error::Timeout
    } else {
        warn!(to = %RedactedAddress(address), error = %e, "Outbound request failed");
        Error::UpstreamUnavailable(format!("{} unreachable", RedactedAddress(address)))
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
        .ok()
        .and_then(|envelope| envelope.error)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
    Err(Error::UpstreamRejected {
        status: status.as_u16(),
        detail,
    })
}

/// Read a body, failing as soon as it grows past `limit` bytes.
async fn read_capped(address: &str, mut response: Response, limit: usize) -> Result<Vec<u8>> {
    let too_large = || {
        warn!(from = %RedactedAddress(address), limit, "Remote file exceeds size limit");
        Error::UpstreamRejected {
            status: StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
            detail: format!("file larger than {} bytes", limit),
        }
    };
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| map_send_error(address, e))?
    {
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

async fn read_data<T: DeserializeOwned>(response: Response) -> Result<Option<T>> {
    let envelope: Envelope<T> = response
        .json()
        .await
        .map_err(|e| Error::Encoding(format!("unexpected response body: {}", e)))?;
    Ok(envelope.data)
}

/// Pull `filename` out of a `Content-Disposition` value.
fn disposition_filename(value: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|part| {
        part.strip_prefix("filename=")
            .map(|name| name.trim_matches('"').to_string())
            .filter(|name| !name.is_empty())
    })
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn start_session(&self, address: &str, request: &StartSessionRequest) -> Result<()> {
        self.post_json(address, routes::START_SESSION, request).await?;
        Ok(())
    }

    async fn close_session(&self, address: &str, request: &CloseSessionRequest) -> Result<()> {
        self.post_json(address, routes::CLOSE_SESSION, request).await?;
        Ok(())
    }

    async fn deliver_message(&self, address: &str, envelope: &SignedEnvelope) -> Result<()> {
        self.post_json(address, routes::SEND_MESSAGE, envelope).await?;
        Ok(())
    }

    async fn fetch_file(&self, address: &str, request: &FetchFileRequest) -> Result<RemoteFile> {
        let response = self.post_json(address, routes::DOWNLOAD_FILE, request).await?;
        let headers = response.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let file_name = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename);
        let bytes = read_capped(address, response, self.max_file_bytes).await?;
        debug!(from = %RedactedAddress(address), body = %RedactedBytes(&bytes), "File fetched");
        Ok(RemoteFile {
            bytes,
            content_type,
            file_name,
        })
    }
}

#[async_trait]
impl DiscoveryTransport for HttpTransport {
    async fn subscribe(&self, discovery: &str, request: &SubscribeRequest) -> Result<()> {
        self.post_json(discovery, routes::SUBSCRIBE, request).await?;
        Ok(())
    }

    async fn unsubscribe(&self, discovery: &str, request: &UnsubscribeRequest) -> Result<()> {
        self.post_json(discovery, routes::UNSUBSCRIBE, request).await?;
        Ok(())
    }

    async fn active_peers(&self, discovery: &str, address: Option<&str>) -> Result<Vec<PeerRecord>> {
        let mut request = self.client.get(endpoint(discovery, routes::ACTIVE_PEERS));
        if let Some(address) = address {
            request = request.query(&[("address", address)]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(discovery, e))?;
        let response = check_status(response).await?;
        Ok(read_data(response).await?.unwrap_or_default())
    }
}
