//! Serving side of the chunk stream protocol.
//!
//! A response body is registered under its request id and then pulled by
//! the remote peer one `ChunkRequest` at a time. Each entry carries its own
//! lock, so requests for different ids never contend and concurrent
//! requests for the same id are served strictly one after another.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use meshgate_core::message::{ChunkAnswer, ErrorCode, RequestId, MAX_CHUNK_SIZE};

use crate::transport::ConnectionId;

/// Upstream body source.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("stream {0} is already registered")]
    DuplicateStream(RequestId),

    #[error("no stream for request {0}")]
    UnknownStream(RequestId),

    #[error("sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: i32, got: i32 },

    #[error("upstream body failed: {0}")]
    SourceFailure(String),

    #[error("sequence number space exhausted for stream {0}")]
    SequenceOverflow(RequestId),

    #[error("requested chunk of {requested} bytes exceeds the {ceiling}-byte ceiling")]
    ChunkTooLarge { requested: usize, ceiling: usize },
}

impl StreamError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StreamError::DuplicateStream(_) => ErrorCode::DuplicateStream,
            StreamError::UnknownStream(_) => ErrorCode::UnknownStream,
            StreamError::SequenceMismatch { .. } => ErrorCode::SequenceMismatch,
            StreamError::SourceFailure(_) => ErrorCode::SourceFailure,
            StreamError::SequenceOverflow(_) => ErrorCode::SequenceOverflow,
            StreamError::ChunkTooLarge { .. } => ErrorCode::ChunkTooLarge,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Hard ceiling for one chunk payload.
    pub chunk_ceiling: usize,
    /// Entries untouched for this long are evicted by the sweep.
    pub idle_timeout: Duration,
    /// Longest wait for the upstream to produce more bytes.
    pub stall_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_ceiling: MAX_CHUNK_SIZE,
            idle_timeout: Duration::from_secs(60),
            stall_timeout: Duration::from_secs(30),
        }
    }
}

struct StreamState {
    body: Option<BodyReader>,
    next_seqno: i32,
    last_activity: Instant,
    /// Bytes read from the body but not yet served. Holding one byte past
    /// the requested size is what lets the final full chunk carry `last`.
    carry: BytesMut,
    eof: bool,
    failed: Option<String>,
}

struct StreamEntry {
    owner: ConnectionId,
    state: Mutex<StreamState>,
}

/// Every open response body, keyed by request id.
#[derive(Clone)]
pub struct StreamTable {
    entries: Arc<DashMap<RequestId, Arc<StreamEntry>>>,
    config: Arc<StreamConfig>,
}

impl StreamTable {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    /// Register a body for `id`, owned by connection `owner`.
    pub fn open_stream(
        &self,
        id: RequestId,
        body: BodyReader,
        owner: ConnectionId,
    ) -> Result<(), StreamError> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(StreamError::DuplicateStream(id)),
            Entry::Vacant(v) => {
                v.insert(Arc::new(StreamEntry {
                    owner,
                    state: Mutex::new(StreamState {
                        body: Some(body),
                        next_seqno: 0,
                        last_activity: Instant::now(),
                        carry: BytesMut::new(),
                        eof: false,
                        failed: None,
                    }),
                }));
                tracing::debug!(id = %id.short(), owner, "stream opened");
                Ok(())
            }
        }
    }

    /// Serve chunk `seqno` of stream `id`, at most `max_size` bytes.
    pub async fn serve_chunk(
        &self,
        id: RequestId,
        seqno: i32,
        max_size: usize,
    ) -> Result<ChunkAnswer, StreamError> {
        let entry = self
            .entries
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StreamError::UnknownStream(id))?;

        let mut state = entry.state.lock().await;

        // Closed, evicted or released while this request waited for the lock.
        if !self.is_current(&id, &entry) {
            return Err(StreamError::UnknownStream(id));
        }
        if let Some(reason) = &state.failed {
            return Err(StreamError::SourceFailure(reason.clone()));
        }
        if seqno != state.next_seqno {
            return Err(StreamError::SequenceMismatch {
                expected: state.next_seqno,
                got: seqno,
            });
        }

        // A chunk cut short by the ceiling would read as the last one on the
        // requesting side, so oversized requests end the stream instead.
        let ceiling = self.config.chunk_ceiling.max(1);
        if max_size > ceiling {
            self.remove_entry(&id, &entry);
            tracing::warn!(id = %id.short(), requested = max_size, ceiling, "chunk request above ceiling");
            return Err(StreamError::ChunkTooLarge {
                requested: max_size,
                ceiling,
            });
        }
        let want = max_size.max(1);
        if let Err(reason) = self.fill(&mut state, want).await {
            tracing::warn!(id = %id.short(), seqno, reason = %reason, "stream source failed");
            state.failed = Some(reason.clone());
            state.body = None;
            state.carry.clear();
            state.last_activity = Instant::now();
            return Err(StreamError::SourceFailure(reason));
        }

        let n = want.min(state.carry.len());
        let data = state.carry.split_to(n).freeze();
        let last = state.eof && state.carry.is_empty();
        state.last_activity = Instant::now();

        if last {
            self.remove_entry(&id, &entry);
            tracing::debug!(id = %id.short(), chunks = seqno as i64 + 1, "stream drained");
            return Ok(ChunkAnswer { data, last });
        }

        match state.next_seqno.checked_add(1) {
            Some(next) => state.next_seqno = next,
            None => {
                self.remove_entry(&id, &entry);
                tracing::warn!(id = %id.short(), "stream exceeded sequence space");
                return Err(StreamError::SequenceOverflow(id));
            }
        }
        Ok(ChunkAnswer { data, last })
    }

    /// Read until the carry holds more than `want` bytes or the body ends.
    async fn fill(&self, state: &mut StreamState, want: usize) -> Result<(), String> {
        while !state.eof && state.carry.len() <= want {
            let Some(body) = state.body.as_mut() else {
                state.eof = true;
                break;
            };
            state.carry.reserve(want + 1 - state.carry.len());
            let read = tokio::time::timeout(self.config.stall_timeout, body.read_buf(&mut state.carry));
            match read.await {
                Ok(Ok(0)) => {
                    state.eof = true;
                    state.body = None;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.to_string()),
                Err(_) => {
                    return Err(format!(
                        "no data from upstream for {:?}",
                        self.config.stall_timeout
                    ))
                }
            }
        }
        Ok(())
    }

    fn is_current(&self, id: &RequestId, entry: &Arc<StreamEntry>) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), entry))
    }

    fn remove_entry(&self, id: &RequestId, entry: &Arc<StreamEntry>) {
        self.entries.remove_if(id, |_, v| Arc::ptr_eq(v, entry));
    }

    /// Drop every stream owned by `owner`. Returns how many were removed.
    pub fn release_owner(&self, owner: ConnectionId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.owner != owner);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(owner, removed, "released streams of closed connection");
        }
        removed
    }

    /// Evict entries idle longer than the idle timeout. Entries being served
    /// right now are skipped.
    pub fn sweep(&self) -> usize {
        let idle = self.config.idle_timeout;
        let before = self.entries.len();
        self.entries.retain(|_, e| match e.state.try_lock() {
            Ok(state) => state.last_activity.elapsed() < idle,
            Err(_) => true,
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "evicted idle streams");
        }
        removed
    }

    /// Run `sweep` every `interval` until cancelled.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        table.sweep();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
impl StreamTable {
    fn set_next_seqno(&self, id: &RequestId, seqno: i32) {
        if let Some(entry) = self.entries.get(id) {
            if let Ok(mut state) = entry.state.try_lock() {
                state.next_seqno = seqno;
            }
        }
    }
}

/// Body reader over an in-memory buffer.
pub fn body_from_bytes(bytes: impl Into<Bytes>) -> BodyReader {
    Box::new(std::io::Cursor::new(bytes.into()))
}
