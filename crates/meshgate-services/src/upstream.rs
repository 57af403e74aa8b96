//! Upstream HTTP origin — the website being bridged.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio_util::io::StreamReader;

use crate::stream::BodyReader;

/// Connection-management headers. These describe one hop and are never
/// forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: Vec<(String, String)>) -> Vec<(String, String)> {
    let listed: Vec<String> = headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, value)| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    headers
        .into_iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            !HOP_BY_HOP.contains(&lower.as_str()) && !listed.contains(&lower)
        })
        .collect()
}

/// Whether a response to `method` with `status` can carry a body at all.
pub fn status_allows_body(method: &str, status: u16) -> bool {
    !(method.eq_ignore_ascii_case("HEAD") || (100..200).contains(&status) || status == 204 || status == 304)
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    /// Absolute URL or origin-form path with query.
    pub url: String,
    pub http_version: String,
    pub headers: Vec<(String, String)>,
}

pub struct UpstreamResponse {
    pub http_version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    /// `None` when the response has no body.
    pub body: Option<BodyReader>,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers.len())
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream request failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Forward a request and return the response head plus body reader.
    async fn forward(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}

// ── reqwest origin ────────────────────────────────────────────────────────────

/// Forwards requests to a fixed HTTP origin.
pub struct HttpUpstream {
    client: reqwest::Client,
    origin: String,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(origin: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        reqwest::Url::parse(origin)
            .map_err(|e| UpstreamError::InvalidRequest(format!("origin {origin}: {e}")))?;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| UpstreamError::Failed(e.to_string()))?;
        Ok(Self {
            client,
            origin: origin.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Origin URL for a request URL, keeping only its path and query.
    pub fn target_url(&self, url: &str) -> Result<reqwest::Url, UpstreamError> {
        let path_and_query = if url.starts_with('/') {
            url.to_string()
        } else {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| UpstreamError::InvalidRequest(format!("url {url}: {e}")))?;
            match parsed.query() {
                Some(q) => format!("{}?{}", parsed.path(), q),
                None => parsed.path().to_string(),
            }
        };
        reqwest::Url::parse(&format!("{}{}", self.origin, path_and_query))
            .map_err(|e| UpstreamError::InvalidRequest(format!("url {url}: {e}")))
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| UpstreamError::InvalidRequest(format!("method {:?}", request.method)))?;
        let url = self.target_url(&request.url)?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in strip_hop_by_hop(request.headers) {
            // The origin gets its own Host; no request body is forwarded.
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| UpstreamError::InvalidRequest(format!("header name {name:?}")))?;
            let value = reqwest::header::HeaderValue::from_str(&value)
                .map_err(|_| UpstreamError::InvalidRequest(format!("header value for {name}")))?;
            headers.append(name, value);
        }

        tracing::debug!(method = %method, url = %url, "forwarding upstream");
        let send = self.client.request(method, url).headers(headers).send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout))?
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout(self.timeout)
                } else {
                    UpstreamError::Failed(e.to_string())
                }
            })?;

        let status = response.status();
        let http_version = format!("{:?}", response.version());
        let reason = status.canonical_reason().unwrap_or("").to_string();
        let headers = strip_hop_by_hop(
            response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        );

        let empty_by_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "0");

        let body: Option<BodyReader> =
            if !status_allows_body(&request.method, status.as_u16()) || empty_by_length {
                None
            } else {
                let stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
                Some(Box::new(StreamReader::new(stream)))
            };

        Ok(UpstreamResponse {
            http_version,
            status: status.as_u16(),
            reason,
            headers,
            body,
        })
    }
}
