//! meshgate integration test harness.
//!
//! Every test runs in-process: an origin (in-memory or a real axum
//! server on 127.0.0.1), a bridge server, and a client talking to it over
//! the loopback or TCP query transport.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use meshgate_core::{Message, RequestId, RequestMessage, Schema};
use meshgate_services::stream::body_from_bytes;
use meshgate_services::{
    BridgeServer, QueryContext, QueryTransport, StreamConfig, StreamTable, TransportError,
    Upstream, UpstreamError, UpstreamRequest, UpstreamResponse,
};

mod bridge;
mod discovery;
mod network;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Deterministic body of `len` bytes.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// In-memory origin answering every request with one fixed response.
pub struct StaticOrigin {
    pub status: u16,
    pub body: Option<Vec<u8>>,
}

impl StaticOrigin {
    pub fn ok(body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            status: 200,
            body: Some(body),
        })
    }

    pub fn no_content() -> Arc<Self> {
        Arc::new(Self {
            status: 204,
            body: None,
        })
    }
}

#[async_trait]
impl Upstream for StaticOrigin {
    async fn forward(&self, _request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        Ok(UpstreamResponse {
            http_version: "HTTP/1.1".into(),
            status: self.status,
            reason: String::new(),
            headers: vec![("Content-Type".into(), "application/octet-stream".into())],
            body: self.body.clone().map(body_from_bytes),
        })
    }
}

pub fn bridge(origin: Arc<dyn Upstream>, streams: StreamConfig) -> BridgeServer {
    BridgeServer::new(
        Arc::new(Schema::standard()),
        origin,
        StreamTable::new(streams),
        Duration::from_secs(5),
    )
}

pub fn ctx(conn_id: u64) -> QueryContext {
    QueryContext {
        conn_id,
        peer: None,
    }
}

pub fn get_request(id: RequestId, url: &str) -> Bytes {
    Message::Request(RequestMessage {
        id,
        method: "GET".into(),
        url: url.into(),
        http_version: "HTTP/1.1".into(),
        headers: vec![("Host".into(), "node.mesh".into())],
    })
    .encode()
}

/// Transport wrapper that records the payload size of every chunk answer.
pub struct Recording {
    inner: Arc<dyn QueryTransport>,
    schema: Schema,
    pub chunk_sizes: Mutex<Vec<usize>>,
}

impl Recording {
    pub fn new(inner: Arc<dyn QueryTransport>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            schema: Schema::standard(),
            chunk_sizes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl QueryTransport for Recording {
    async fn query(
        &self,
        payload: Bytes,
        max_answer_size: usize,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        let answer = self.inner.query(payload, max_answer_size, timeout).await?;
        if let Ok(Message::Chunk(chunk)) = self.schema.decode(&answer) {
            self.chunk_sizes.lock().unwrap().push(chunk.data.len());
        }
        Ok(answer)
    }
}

/// Real HTTP origin on an ephemeral port.
///
///   GET /big      300,000 patterned bytes
///   GET /hello    "hello"
///   GET /missing  404
pub async fn start_origin() -> SocketAddr {
    use axum::http::StatusCode;
    use axum::routing::get;

    let app = axum::Router::new()
        .route("/big", get(|| async { patterned(300_000) }))
        .route("/hello", get(|| async { "hello" }))
        .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "no such page") }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
