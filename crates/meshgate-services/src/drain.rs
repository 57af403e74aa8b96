//! Requesting side of the chunk stream protocol.
//!
//! `drain` pulls a response body chunk by chunk and writes it, in order,
//! to any `AsyncWrite`. A failed query is retried with the same sequence
//! number after a backoff; an error answer from the remote ends the stream.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use meshgate_core::message::{ChunkRequest, ErrorCode, Message, RequestId, Schema, MAX_CHUNK_SIZE};
use meshgate_core::wire::WireError;

use crate::transport::{QueryTransport, TransportError};

/// Room for the chunk answer framing around the payload, and for error
/// answers with a long reason.
const ANSWER_OVERHEAD: usize = 4 * 1024;

#[derive(Debug, Clone)]
pub struct DrainOptions {
    /// Requested chunk size.
    pub max_chunk: usize,
    /// Retries per chunk after the first failed query.
    pub retries: u32,
    pub retry_backoff: Duration,
    pub query_timeout: Duration,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            max_chunk: MAX_CHUNK_SIZE,
            retries: 3,
            retry_backoff: Duration::from_millis(500),
            query_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub chunks: u64,
    pub bytes: u64,
}

/// Every way a body stream can be aborted.
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error("chunk {seqno}: query failed after {attempts} attempts: {source}")]
    Transport {
        seqno: i32,
        attempts: u32,
        source: TransportError,
    },

    #[error("chunk {seqno}: remote error {code}: {reason}")]
    Remote {
        seqno: i32,
        code: ErrorCode,
        reason: String,
    },

    #[error("chunk {seqno}: {source}")]
    Malformed { seqno: i32, source: WireError },

    #[error("chunk {seqno}: unexpected {kind} answer")]
    Unexpected { seqno: i32, kind: &'static str },

    #[error("chunk {seqno}: payload of {size} bytes exceeds the requested {max}")]
    Oversized { seqno: i32, size: usize, max: usize },

    #[error("sequence number space exhausted")]
    SequenceOverflow,

    #[error("writing body failed: {0}")]
    Sink(std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

/// Pull the body of stream `id` into `sink` until a terminal answer.
///
/// The requested chunk size is capped at `MAX_CHUNK_SIZE`, the ceiling every
/// server serves in full.
pub async fn drain<W>(
    schema: &Schema,
    id: RequestId,
    transport: &dyn QueryTransport,
    sink: &mut W,
    opts: &DrainOptions,
    cancel: &CancellationToken,
) -> Result<DrainStats, DrainError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    drain_from(schema, id, transport, sink, opts, cancel, 0).await
}

async fn drain_from<W>(
    schema: &Schema,
    id: RequestId,
    transport: &dyn QueryTransport,
    sink: &mut W,
    opts: &DrainOptions,
    cancel: &CancellationToken,
    first_seqno: i32,
) -> Result<DrainStats, DrainError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let max_chunk = opts.max_chunk.clamp(1, MAX_CHUNK_SIZE);
    let max_answer = max_chunk + ANSWER_OVERHEAD;
    let mut stats = DrainStats::default();
    let mut seqno = first_seqno;

    loop {
        let query = Message::ChunkRequest(ChunkRequest {
            id,
            seqno,
            max_chunk_size: max_chunk as i32,
        })
        .encode();

        let mut attempts = 0u32;
        let answer = loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DrainError::Cancelled),
                r = transport.query(query.clone(), max_answer, opts.query_timeout) => r,
            };
            match result {
                Ok(answer) => break answer,
                Err(e) if attempts > opts.retries => {
                    return Err(DrainError::Transport {
                        seqno,
                        attempts,
                        source: e,
                    })
                }
                Err(e) => {
                    tracing::debug!(
                        id = %id.short(),
                        seqno,
                        attempt = attempts,
                        error = %e,
                        "chunk query failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(DrainError::Cancelled),
                        _ = tokio::time::sleep(opts.retry_backoff) => {}
                    }
                }
            }
        };

        let chunk = match schema.decode(&answer) {
            Ok(Message::Chunk(c)) => c,
            Ok(Message::Error(e)) => {
                return Err(DrainError::Remote {
                    seqno,
                    code: e.code,
                    reason: e.reason,
                })
            }
            Ok(other) => {
                return Err(DrainError::Unexpected {
                    seqno,
                    kind: other.name(),
                })
            }
            Err(source) => return Err(DrainError::Malformed { seqno, source }),
        };
        if chunk.data.len() > max_chunk {
            return Err(DrainError::Oversized {
                seqno,
                size: chunk.data.len(),
                max: max_chunk,
            });
        }

        sink.write_all(&chunk.data).await.map_err(DrainError::Sink)?;
        stats.chunks += 1;
        stats.bytes += chunk.data.len() as u64;

        if chunk.is_terminal(max_chunk) {
            break;
        }
        seqno = seqno.checked_add(1).ok_or(DrainError::SequenceOverflow)?;
    }

    sink.flush().await.map_err(DrainError::Sink)?;
    tracing::debug!(id = %id.short(), chunks = stats.chunks, bytes = stats.bytes, "body drained");
    Ok(stats)
}
