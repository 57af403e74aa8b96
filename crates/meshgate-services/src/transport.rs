//! Query/answer transport seam.
//!
//! The overlay offers one primitive: send a bounded query to a node and
//! wait, with a timeout, for a bounded answer. `QueryTransport` is the
//! requesting side of that primitive, `QueryHandler` the serving side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Identifies the connection a query arrived on. Streams opened while
/// serving a query are owned by this connection.
pub type ConnectionId = u64;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("answer of {size} bytes exceeds the {max} byte limit")]
    AnswerTooLarge { size: usize, max: usize },

    #[error("connection closed")]
    Closed,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Where a query came from.
#[derive(Debug, Clone, Copy)]
pub struct QueryContext {
    pub conn_id: ConnectionId,
    pub peer: Option<SocketAddr>,
}

/// Requesting side: send one query, await one answer.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn query(
        &self,
        payload: Bytes,
        max_answer_size: usize,
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;
}

/// Serving side: turn one query into one answer.
///
/// Handlers never fail at this level; every exchange-local failure is
/// encoded into the answer itself.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn handle_query(&self, ctx: QueryContext, payload: Bytes) -> Bytes;

    /// Called once when the connection `conn_id` is torn down.
    async fn connection_closed(&self, _conn_id: ConnectionId) {}
}

// ── Loopback ──────────────────────────────────────────────────────────────────

/// In-process transport that hands queries straight to a handler.
///
/// Enforces the same timeout and answer-size limits as a network transport.
pub struct LoopbackTransport {
    handler: Arc<dyn QueryHandler>,
    conn_id: ConnectionId,
}

impl LoopbackTransport {
    pub fn new(handler: Arc<dyn QueryHandler>, conn_id: ConnectionId) -> Self {
        Self { handler, conn_id }
    }

    /// Simulate teardown of this loopback connection.
    pub async fn close(&self) {
        self.handler.connection_closed(self.conn_id).await;
    }
}

#[async_trait]
impl QueryTransport for LoopbackTransport {
    async fn query(
        &self,
        payload: Bytes,
        max_answer_size: usize,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        let ctx = QueryContext {
            conn_id: self.conn_id,
            peer: None,
        };
        let answer = tokio::time::timeout(timeout, self.handler.handle_query(ctx, payload))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?;
        if answer.len() > max_answer_size {
            return Err(TransportError::AnswerTooLarge {
                size: answer.len(),
                max: max_answer_size,
            });
        }
        Ok(answer)
    }
}
