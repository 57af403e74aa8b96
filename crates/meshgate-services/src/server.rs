//! Bridge server — turns inbound queries into upstream HTTP calls.
//!
//! Per request id the exchange moves through
//!
//!   Received → Forwarding → HeadersSent → Streaming → Closed
//!
//! and any step can fall into `Errored`. Ids are tracked in `exchanges`
//! until the head has been answered; from then on the stream table owns
//! the id until the body is drained, evicted, or released.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use meshgate_core::message::{
    ChunkRequest, ErrorAnswer, ErrorCode, Message, RequestId, RequestMessage, ResponseMessage,
    Schema,
};

use crate::stream::StreamTable;
use crate::transport::{ConnectionId, QueryContext, QueryHandler};
use crate::upstream::{strip_hop_by_hop, Upstream, UpstreamError, UpstreamRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Received,
    Forwarding,
    HeadersSent,
    Streaming,
    Closed,
    Errored,
}

impl ExchangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeState::Received => "received",
            ExchangeState::Forwarding => "forwarding",
            ExchangeState::HeadersSent => "headers_sent",
            ExchangeState::Streaming => "streaming",
            ExchangeState::Closed => "closed",
            ExchangeState::Errored => "errored",
        }
    }
}

/// Exchanges whose head has not been answered yet.
pub type ExchangeTable = Arc<DashMap<RequestId, ExchangeState>>;

/// Removes an exchange from the table when dropped, whichever way the
/// request handler exits.
struct ExchangeGuard {
    table: ExchangeTable,
    id: RequestId,
}

impl ExchangeGuard {
    fn set(&self, state: ExchangeState) {
        if let Some(mut e) = self.table.get_mut(&self.id) {
            tracing::trace!(id = %self.id.short(), from = e.as_str(), to = state.as_str(), "exchange");
            *e = state;
        }
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

#[derive(Clone)]
pub struct BridgeServer {
    schema: Arc<Schema>,
    upstream: Arc<dyn Upstream>,
    streams: StreamTable,
    exchanges: ExchangeTable,
    upstream_timeout: Duration,
}

impl BridgeServer {
    pub fn new(
        schema: Arc<Schema>,
        upstream: Arc<dyn Upstream>,
        streams: StreamTable,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            schema,
            upstream,
            streams,
            exchanges: Arc::new(DashMap::new()),
            upstream_timeout,
        }
    }

    pub fn streams(&self) -> &StreamTable {
        &self.streams
    }

    /// Number of exchanges still waiting on the upstream.
    pub fn in_flight(&self) -> usize {
        self.exchanges.len()
    }

    /// Current state of `id`, if the server still tracks it.
    pub fn exchange_state(&self, id: &RequestId) -> Option<ExchangeState> {
        self.exchanges
            .get(id)
            .map(|e| *e.value())
            .or_else(|| self.streams.contains(id).then_some(ExchangeState::Streaming))
    }

    /// Decode, dispatch, and encode one query.
    pub async fn handle(&self, ctx: QueryContext, payload: &[u8]) -> Message {
        let message = match self.schema.decode(payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(conn_id = ctx.conn_id, error = %e, "malformed query");
                return ErrorAnswer::new(ErrorCode::MalformedMessage, e.to_string()).into();
            }
        };
        match message {
            Message::Request(req) => self.handle_request(ctx, req).await,
            Message::ChunkRequest(req) => self.handle_chunk_request(req).await,
            other => ErrorAnswer::new(
                ErrorCode::UnexpectedMessage,
                format!("{} is not a query", other.name()),
            )
            .into(),
        }
    }

    async fn handle_request(&self, ctx: QueryContext, req: RequestMessage) -> Message {
        let id = req.id;
        let guard = match self.exchanges.entry(id) {
            Entry::Occupied(_) => return duplicate(id),
            Entry::Vacant(v) => {
                v.insert(ExchangeState::Received);
                ExchangeGuard {
                    table: self.exchanges.clone(),
                    id,
                }
            }
        };
        if self.streams.contains(&id) {
            return duplicate(id);
        }

        tracing::info!(
            id = %id.short(),
            conn_id = ctx.conn_id,
            method = %req.method,
            url = %req.url,
            "inbound request"
        );

        guard.set(ExchangeState::Forwarding);
        let method = req.method.clone();
        let forward = self.upstream.forward(UpstreamRequest {
            method: req.method,
            url: req.url,
            http_version: req.http_version,
            headers: strip_hop_by_hop(req.headers),
        });
        let response = match tokio::time::timeout(self.upstream_timeout, forward).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return upstream_error(&guard, id, e),
            Err(_) => return upstream_error(&guard, id, UpstreamError::Timeout(self.upstream_timeout)),
        };

        let status = response.status;
        let no_body = response.body.is_none();
        if let Some(body) = response.body {
            if let Err(e) = self.streams.open_stream(id, body, ctx.conn_id) {
                guard.set(ExchangeState::Errored);
                return ErrorAnswer::new(e.code(), e.to_string()).into();
            }
        }

        guard.set(ExchangeState::HeadersSent);
        let next = if no_body {
            ExchangeState::Closed
        } else {
            ExchangeState::Streaming
        };
        guard.set(next);
        tracing::info!(id = %id.short(), %method, status, no_body, "response head sent");

        Message::Response(ResponseMessage {
            http_version: response.http_version,
            status,
            reason: response.reason,
            headers: strip_hop_by_hop(response.headers),
            no_body,
        })
    }

    async fn handle_chunk_request(&self, req: ChunkRequest) -> Message {
        let max = req.max_chunk_size.max(1) as usize;
        match self.streams.serve_chunk(req.id, req.seqno, max).await {
            Ok(chunk) => Message::Chunk(chunk),
            Err(e) => {
                tracing::debug!(id = %req.id.short(), seqno = req.seqno, error = %e, "chunk request refused");
                ErrorAnswer::new(e.code(), e.to_string()).into()
            }
        }
    }
}

fn duplicate(id: RequestId) -> Message {
    tracing::warn!(id = %id.short(), "duplicate request id");
    ErrorAnswer::new(
        ErrorCode::DuplicateStream,
        format!("request {} is already in progress", id.short()),
    )
    .into()
}

fn upstream_error(guard: &ExchangeGuard, id: RequestId, e: UpstreamError) -> Message {
    guard.set(ExchangeState::Errored);
    tracing::warn!(id = %id.short(), error = %e, "upstream call failed");
    let code = match e {
        UpstreamError::Timeout(_) => ErrorCode::UpstreamTimeout,
        UpstreamError::InvalidRequest(_) => ErrorCode::MalformedMessage,
        UpstreamError::Failed(_) => ErrorCode::UpstreamFailure,
    };
    ErrorAnswer::new(code, e.to_string()).into()
}

#[async_trait]
impl QueryHandler for BridgeServer {
    async fn handle_query(&self, ctx: QueryContext, payload: Bytes) -> Bytes {
        self.handle(ctx, &payload).await.encode()
    }

    async fn connection_closed(&self, conn_id: ConnectionId) {
        self.streams.release_owner(conn_id);
    }
}
