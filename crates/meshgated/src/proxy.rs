//! Local HTTP proxy front-end.
//!
//! A request for `http://<node-address>.mesh/<path>` is resolved through
//! the directory, sent to that node over a (pooled) TCP query connection,
//! and answered with the streamed response.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use meshgate_core::{AddressError, NodeAddress, Schema};
use meshgate_services::upstream::strip_hop_by_hop;
use meshgate_services::{
    BridgeClient, ClientError, ClientOptions, Directory, DirectoryError, FetchRequest,
    TcpQueryClient, TransportError,
};

const MESH_SUFFIX: &str = ".mesh";

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("host {0:?} is not a <node-address>.mesh name")]
    BadHost(String),

    #[error("invalid node address: {0}")]
    BadAddress(#[from] AddressError),

    #[error("request bodies are not carried over the bridge")]
    BodyNotSupported,

    #[error("cannot resolve node: {0}")]
    Directory(#[from] DirectoryError),

    #[error("cannot reach node at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: TransportError,
    },

    #[error("{0}")]
    Client(#[from] ClientError),

    #[error("invalid response from node: {0}")]
    BadResponse(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::BadHost(_) | ProxyError::BadAddress(_) => StatusCode::BAD_REQUEST,
            ProxyError::BodyNotSupported => StatusCode::NOT_IMPLEMENTED,
            ProxyError::Client(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        tracing::warn!(status = status.as_u16(), error = %self, "proxy request failed");
        (status, self.to_string()).into_response()
    }
}

/// Node address named by a `Host` value, e.g. `abc…xyz.mesh:8119`.
pub fn parse_mesh_host(host: &str) -> Result<NodeAddress, ProxyError> {
    let name = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    let name = name.trim_end_matches('.');
    let label = name
        .strip_suffix(MESH_SUFFIX)
        .ok_or_else(|| ProxyError::BadHost(host.to_string()))?;
    Ok(label.parse::<NodeAddress>()?)
}

#[derive(Clone)]
pub struct ProxyState {
    schema: Arc<Schema>,
    directory: Arc<dyn Directory>,
    connections: Arc<DashMap<NodeAddress, Arc<TcpQueryClient>>>,
    opts: ClientOptions,
}

impl ProxyState {
    pub fn new(schema: Arc<Schema>, directory: Arc<dyn Directory>, opts: ClientOptions) -> Self {
        Self {
            schema,
            directory,
            connections: Arc::new(DashMap::new()),
            opts,
        }
    }

    /// Reuse an open connection to `address` or dial a fresh one.
    async fn connection(&self, address: NodeAddress) -> Result<Arc<TcpQueryClient>, ProxyError> {
        if let Some(conn) = self.connections.get(&address) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }
        self.connections.remove_if(&address, |_, c| c.is_closed());

        let record = self.directory.find(&address).await?;
        let conn = TcpQueryClient::connect(&record.endpoint)
            .await
            .map(Arc::new)
            .map_err(|source| ProxyError::Connect {
                endpoint: record.endpoint.clone(),
                source,
            })?;
        tracing::info!(node = %address.short(), endpoint = %record.endpoint, "connected to node");
        self.connections.insert(address, conn.clone());
        Ok(conn)
    }

    async fn forward(&self, req: Request) -> Result<Response, ProxyError> {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .ok_or_else(|| ProxyError::BadHost(String::new()))?;
        let address = parse_mesh_host(&host)?;

        let has_body = req.headers().contains_key(header::TRANSFER_ENCODING)
            || req
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.trim() != "0");
        if has_body {
            return Err(ProxyError::BodyNotSupported);
        }

        let fetch = FetchRequest {
            method: req.method().as_str().to_string(),
            url: req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            http_version: format!("{:?}", req.version()),
            headers: strip_hop_by_hop(
                req.headers()
                    .iter()
                    .map(|(n, v)| {
                        (
                            n.as_str().to_string(),
                            String::from_utf8_lossy(v.as_bytes()).into_owned(),
                        )
                    })
                    .collect(),
            ),
        };

        let conn = self.connection(address).await?;
        let client = BridgeClient::new(self.schema.clone(), conn, self.opts.clone());
        let (head, body) = client.fetch_streaming(fetch).await?;

        let status = StatusCode::from_u16(head.status)
            .map_err(|_| ProxyError::BadResponse(format!("status {}", head.status)))?;
        let mut builder = Response::builder().status(status);
        for (name, value) in head.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(n), Ok(v)) => builder = builder.header(n, v),
                _ => tracing::debug!(header = %name, "dropping unrepresentable header"),
            }
        }
        let body = match body {
            Some(b) => Body::from_stream(b.into_stream()),
            None => Body::empty(),
        };
        builder
            .body(body)
            .map_err(|e| ProxyError::BadResponse(e.to_string()))
    }
}

async fn handle(State(state): State<ProxyState>, req: Request) -> Response {
    match state.forward(req).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(state: ProxyState, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "proxy listening on 127.0.0.1");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use meshgate_services::{
        BridgeServer, HttpUpstream, MemoryDirectory, PublishRecord, StreamConfig, StreamTable,
        TcpQueryListener,
    };

    /// Origin, bridge node and proxy state wired together on 127.0.0.1.
    /// Returns the state and the address the node is published under.
    async fn mesh() -> (ProxyState, NodeAddress, CancellationToken) {
        let app = Router::new().route("/hello", axum::routing::get(|| async { "hello" }));
        let origin = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(origin, app).await.unwrap();
        });

        let schema = Arc::new(Schema::standard());
        let upstream =
            HttpUpstream::new(&format!("http://{origin_addr}"), Duration::from_secs(5)).unwrap();
        let server = BridgeServer::new(
            schema.clone(),
            Arc::new(upstream),
            StreamTable::new(StreamConfig::default()),
            Duration::from_secs(5),
        );
        let listener = TcpQueryListener::bind("127.0.0.1:0", Arc::new(server))
            .await
            .unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(listener.run(cancel.clone()));

        let node = NodeAddress::derive(b"proxied node");
        let directory = MemoryDirectory::new();
        directory
            .publish(PublishRecord::new(node, endpoint, Duration::from_secs(60)))
            .await
            .unwrap();
        let state = ProxyState::new(schema, Arc::new(directory), ClientOptions::default());
        (state, node, cancel)
    }

    fn request(host: &str, path: &str) -> axum::http::request::Builder {
        Request::builder().uri(path).header(header::HOST, host)
    }

    #[test]
    fn parses_mesh_hosts() {
        let addr = NodeAddress::derive(b"site");
        let expected = addr;
        assert_eq!(parse_mesh_host(&format!("{addr}.mesh")).unwrap(), expected);
        assert_eq!(parse_mesh_host(&format!("{addr}.mesh:8119")).unwrap(), expected);
        assert_eq!(parse_mesh_host(&format!("{addr}.mesh.")).unwrap(), expected);
    }

    #[test]
    fn rejects_other_hosts() {
        assert!(matches!(
            parse_mesh_host("example.com"),
            Err(ProxyError::BadHost(_))
        ));
        assert!(matches!(
            parse_mesh_host("notanaddress.mesh"),
            Err(ProxyError::BadAddress(_))
        ));
    }

    #[test]
    fn timeouts_map_to_gateway_timeout() {
        let resp = ProxyError::Client(ClientError::RequestTimeout(std::time::Duration::from_secs(1)))
            .into_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        let resp = ProxyError::BodyNotSupported.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn forwards_to_published_node() {
        let (state, node, cancel) = mesh().await;
        let req = request(&format!("{node}.mesh:8119"), "/hello")
            .body(Body::empty())
            .unwrap();
        let resp = state.forward(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello");
        assert_eq!(state.connections.len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn request_with_body_is_not_implemented() {
        let (state, node, cancel) = mesh().await;
        let req = request(&format!("{node}.mesh"), "/hello")
            .method("POST")
            .header(header::CONTENT_LENGTH, "5")
            .body(Body::from("hello"))
            .unwrap();
        let err = state.forward(req).await.unwrap_err();
        assert!(matches!(err, ProxyError::BodyNotSupported));
        assert_eq!(err.into_response().status(), StatusCode::NOT_IMPLEMENTED);
        assert!(state.connections.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn unpublished_node_is_bad_gateway() {
        let (state, _node, cancel) = mesh().await;
        let stranger = NodeAddress::derive(b"nobody published this");
        let req = request(&format!("{stranger}.mesh"), "/hello")
            .body(Body::empty())
            .unwrap();
        let err = state.forward(req).await.unwrap_err();
        assert!(matches!(err, ProxyError::Directory(DirectoryError::NotFound(_))));
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
        cancel.cancel();
    }
}
