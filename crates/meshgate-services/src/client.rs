//! Requesting side of the bridge: an HTTP-shaped call to a remote node.
//!
//! The head comes back from a single `Request` query; the body, if any, is
//! pulled afterwards with `drain`. The initial query is not retried: the
//! server treats a repeated id as a duplicate, so a lost answer cannot be
//! recovered by sending the request again.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use meshgate_core::message::{ErrorCode, Message, RequestId, RequestMessage, Schema, MAX_CHUNK_SIZE};
use meshgate_core::wire::{WireError, MAX_MESSAGE_LEN};

use crate::drain::{drain, DrainError, DrainOptions, DrainStats};
use crate::transport::{QueryTransport, TransportError};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Timeout for the request query (up to the response head).
    pub request_timeout: Duration,
    pub drain: DrainOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            drain: DrainOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            url: url.into(),
            http_version: "HTTP/1.1".into(),
            headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub http_version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct FetchResponse {
    pub head: ResponseHead,
    pub body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no answer to request within {0:?}")]
    RequestTimeout(Duration),

    #[error("request query failed: {0}")]
    Transport(TransportError),

    #[error("remote refused request: {code}: {reason}")]
    Remote { code: ErrorCode, reason: String },

    #[error("malformed answer: {0}")]
    Malformed(#[from] WireError),

    #[error("unexpected {0} answer to request")]
    Unexpected(&'static str),

    #[error("body stream aborted: {0}")]
    StreamAborted(#[from] DrainError),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::RequestTimeout(_))
    }
}

pub struct BridgeClient {
    schema: Arc<Schema>,
    transport: Arc<dyn QueryTransport>,
    opts: ClientOptions,
}

impl BridgeClient {
    pub fn new(schema: Arc<Schema>, transport: Arc<dyn QueryTransport>, opts: ClientOptions) -> Self {
        Self {
            schema,
            transport,
            opts,
        }
    }

    /// Fetch the whole response into memory.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ClientError> {
        let (head, body) = self.fetch_streaming(request).await?;
        let Some(mut body) = body else {
            return Ok(FetchResponse {
                head,
                body: Bytes::new(),
            });
        };
        let mut buf = Vec::new();
        let read = body.read_to_end(&mut buf).await;
        // A drain failure explains a read failure, so it is reported first.
        body.finish().await?;
        read.map_err(|e| ClientError::StreamAborted(DrainError::Sink(e)))?;
        Ok(FetchResponse {
            head,
            body: Bytes::from(buf),
        })
    }

    /// Fetch the head, then stream the body as it arrives.
    pub async fn fetch_streaming(
        &self,
        request: FetchRequest,
    ) -> Result<(ResponseHead, Option<StreamingBody>), ClientError> {
        let id = RequestId::random();
        let query = Message::Request(RequestMessage {
            id,
            method: request.method,
            url: request.url,
            http_version: request.http_version,
            headers: request.headers,
        })
        .encode();

        let answer = self
            .transport
            .query(query, MAX_MESSAGE_LEN, self.opts.request_timeout)
            .await
            .map_err(|e| match e {
                TransportError::Timeout(t) => ClientError::RequestTimeout(t),
                other => ClientError::Transport(other),
            })?;

        let response = match self.schema.decode(&answer)? {
            Message::Response(r) => r,
            Message::Error(e) => {
                return Err(ClientError::Remote {
                    code: e.code,
                    reason: e.reason,
                })
            }
            other => return Err(ClientError::Unexpected(other.name())),
        };

        let head = ResponseHead {
            http_version: response.http_version,
            status: response.status,
            reason: response.reason,
            headers: response.headers,
        };
        tracing::debug!(id = %id.short(), status = head.status, no_body = response.no_body, "response head received");
        if response.no_body {
            return Ok((head, None));
        }

        let pipe_size = self.opts.drain.max_chunk.clamp(1, MAX_CHUNK_SIZE) * 2;
        let (mut writer, reader) = tokio::io::duplex(pipe_size);
        let cancel = CancellationToken::new();
        let task = {
            let schema = self.schema.clone();
            let transport = self.transport.clone();
            let opts = self.opts.drain.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = drain(&schema, id, transport.as_ref(), &mut writer, &opts, &cancel).await;
                if let Err(e) = &result {
                    tracing::warn!(id = %id.short(), error = %e, "body stream aborted");
                }
                result
            })
        };

        Ok((
            head,
            Some(StreamingBody {
                reader,
                task,
                _cancel: cancel.drop_guard(),
            }),
        ))
    }
}

/// Response body fed by a background drain task.
///
/// Reads end at EOF when the drain finishes or fails; `finish` tells the two
/// apart. Dropping the body cancels the drain.
pub struct StreamingBody {
    reader: DuplexStream,
    task: JoinHandle<Result<DrainStats, DrainError>>,
    _cancel: DropGuard,
}

impl StreamingBody {
    /// Wait for the drain task and report how the stream ended.
    ///
    /// Unread body bytes are discarded; a drain still writing into them
    /// fails with a broken pipe.
    pub async fn finish(self) -> Result<DrainStats, ClientError> {
        let StreamingBody {
            reader,
            task,
            _cancel: guard,
        } = self;
        drop(reader);
        let joined = task.await;
        drop(guard);
        match joined {
            Ok(result) => Ok(result?),
            Err(e) => Err(ClientError::StreamAborted(DrainError::Sink(io::Error::other(e)))),
        }
    }

    /// Body as a byte stream that yields an error if the drain aborted.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send {
        use futures::StreamExt;

        let StreamingBody {
            reader,
            task,
            _cancel: guard,
        } = self;
        // The guard lives until the drain result is known.
        let tail = futures::stream::once(async move {
            let _guard = guard;
            match task.await {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(Err(io::Error::other(e))),
                Err(e) => Some(Err(io::Error::other(e))),
            }
        })
        .filter_map(|item| async move { item });
        ReaderStream::new(reader).chain(tail)
    }
}

impl AsyncRead for StreamingBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}
