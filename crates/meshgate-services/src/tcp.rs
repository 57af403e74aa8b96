//! TCP query transport.
//!
//! Many concurrent queries share one connection. Frame layout, all
//! integers little-endian:
//!
//!   [u32 length][u64 query id][u8 kind][payload]
//!
//! `length` counts everything after itself. `kind` is 0 for a query and 1
//! for an answer; an answer carries the id of the query it answers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use meshgate_core::message::MAX_CHUNK_SIZE;
use meshgate_core::wire::MAX_MESSAGE_LEN;

use crate::transport::{ConnectionId, QueryContext, QueryHandler, QueryTransport, TransportError};

const KIND_QUERY: u8 = 0;
const KIND_ANSWER: u8 = 1;

/// id + kind
const FRAME_HEADER_LEN: usize = 8 + 1;

/// Largest frame either side will read.
pub const MAX_FRAME_LEN: usize = FRAME_HEADER_LEN + MAX_MESSAGE_LEN + MAX_CHUNK_SIZE;

#[derive(Debug)]
struct Frame {
    query_id: u64,
    kind: u8,
    payload: Bytes,
}

fn encode_frame(query_id: u64, kind: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + FRAME_HEADER_LEN + payload.len());
    buf.put_u32_le((FRAME_HEADER_LEN + payload.len()) as u32);
    buf.put_u64_le(query_id);
    buf.put_u8(kind);
    buf.put_slice(payload);
    buf.freeze()
}

/// Read one frame. `Ok(None)` on clean EOF at a frame boundary.
async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>, TransportError> {
    let len = match r.read_u32_le().await {
        Ok(n) => n as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !(FRAME_HEADER_LEN..=MAX_FRAME_LEN).contains(&len) {
        return Err(TransportError::Protocol(format!("frame length {len} out of range")));
    }
    let query_id = r.read_u64_le().await?;
    let kind = r.read_u8().await?;
    let mut payload = vec![0u8; len - FRAME_HEADER_LEN];
    r.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        query_id,
        kind,
        payload: Bytes::from(payload),
    }))
}

// ── Listener (serving side) ───────────────────────────────────────────────────

/// Accepts connections and drives a `QueryHandler` for each query.
pub struct TcpQueryListener {
    listener: TcpListener,
    handler: Arc<dyn QueryHandler>,
    next_conn: AtomicU64,
}

impl TcpQueryListener {
    pub async fn bind(addr: &str, handler: Arc<dyn QueryHandler>) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler,
            next_conn: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "query listener started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("query listener shutting down");
                    return;
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        conn_id,
                        self.handler.clone(),
                        cancel.child_token(),
                    ));
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: ConnectionId,
    handler: Arc<dyn QueryHandler>,
    cancel: CancellationToken,
) {
    tracing::debug!(conn_id, %peer, "connection opened");
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let (answer_tx, answer_rx) = mpsc::channel::<Bytes>(64);
    let writer_task = tokio::spawn(write_loop(writer, answer_rx));
    let mut queries = JoinSet::new();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            f = read_frame(&mut reader) => f,
        };
        let frame = match frame {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(conn_id, error = %e, "dropping connection");
                break;
            }
        };
        if frame.kind != KIND_QUERY {
            tracing::warn!(conn_id, kind = frame.kind, "unexpected frame kind from client");
            break;
        }

        while queries.try_join_next().is_some() {}
        let handler = handler.clone();
        let answer_tx = answer_tx.clone();
        queries.spawn(async move {
            let ctx = QueryContext {
                conn_id,
                peer: Some(peer),
            };
            let answer = handler.handle_query(ctx, frame.payload).await;
            let _ = answer_tx
                .send(encode_frame(frame.query_id, KIND_ANSWER, &answer))
                .await;
        });
    }

    // Queries still running belong to a peer that is gone.
    queries.abort_all();
    while queries.join_next().await.is_some() {}
    drop(answer_tx);
    handler.connection_closed(conn_id).await;
    writer_task.abort();
    tracing::debug!(conn_id, %peer, "connection closed");
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!(error = %e, "write failed");
            return;
        }
    }
}

// ── Client (requesting side) ──────────────────────────────────────────────────

type PendingTable = Arc<DashMap<u64, oneshot::Sender<Bytes>>>;

/// One multiplexed connection to a remote `TcpQueryListener`.
///
/// Query frames go through a single writer task, so a caller that gives up
/// mid-send never leaves a partial frame on the connection.
pub struct TcpQueryClient {
    frames: mpsc::Sender<Bytes>,
    pending: PendingTable,
    next_query: AtomicU64,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    peer: SocketAddr,
}

impl TcpQueryClient {
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let pending: PendingTable = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(read_answers(reader, pending.clone(), closed.clone()));
        let (frames, frame_rx) = mpsc::channel::<Bytes>(64);
        let writer_task = tokio::spawn(write_queries(writer, frame_rx, pending.clone(), closed.clone()));

        tracing::debug!(%peer, "query connection established");
        Ok(Self {
            frames,
            pending,
            next_query: AtomicU64::new(1),
            closed,
            reader_task,
            writer_task,
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn send_query(&self, query_id: u64, payload: &[u8]) -> Result<(), TransportError> {
        let frame = encode_frame(query_id, KIND_QUERY, payload);
        self.frames.send(frame).await.map_err(|_| TransportError::Closed)
    }
}

impl Drop for TcpQueryClient {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

async fn write_queries(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut frames: mpsc::Receiver<Bytes>,
    pending: PendingTable,
    closed: Arc<AtomicBool>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!(error = %e, "query writer stopped");
            closed.store(true, Ordering::Release);
            pending.clear();
            return;
        }
    }
}

async fn read_answers(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    pending: PendingTable,
    closed: Arc<AtomicBool>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) if frame.kind == KIND_ANSWER => {
                // A missing entry means the caller already gave up.
                if let Some((_, tx)) = pending.remove(&frame.query_id) {
                    let _ = tx.send(frame.payload);
                }
            }
            Ok(Some(frame)) => {
                tracing::warn!(kind = frame.kind, "unexpected frame kind from server");
                break;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "answer reader stopped");
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    // Dropping the senders wakes every waiter with `Closed`.
    pending.clear();
}

#[async_trait]
impl QueryTransport for TcpQueryClient {
    async fn query(
        &self,
        payload: Bytes,
        max_answer_size: usize,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let query_id = self.next_query.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(query_id, tx);

        let exchange = async {
            self.send_query(query_id, &payload).await?;
            rx.await.map_err(|_| TransportError::Closed)
        };
        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(r) => r,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        if result.is_err() {
            self.pending.remove(&query_id);
        }

        let answer = result?;
        if answer.len() > max_answer_size {
            return Err(TransportError::AnswerTooLarge {
                size: answer.len(),
                max: max_answer_size,
            });
        }
        Ok(answer)
    }
}
