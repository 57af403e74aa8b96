//! Message schema — the typed messages exchanged over query/answer.
//!
//! Every encoded message is `u32 type tag || body`. The tag is the first
//! four bytes (little-endian) of BLAKE3 over the canonical message name, so
//! tags are stable across implementations without a central numbering.
//!
//! Query messages:  `Request`, `ChunkRequest`
//! Answer messages: `Response`, `Chunk`, `Error`

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use rand::RngCore;

use crate::wire::{Reader, WireError, Writer, MAX_MESSAGE_LEN};

// ── Names & tags ──────────────────────────────────────────────────────────────

pub const REQUEST_NAME: &str = "meshgate.http.request";
pub const RESPONSE_NAME: &str = "meshgate.http.response";
pub const CHUNK_REQUEST_NAME: &str = "meshgate.http.chunk_request";
pub const CHUNK_NAME: &str = "meshgate.http.chunk";
pub const ERROR_NAME: &str = "meshgate.error";

/// Compute the wire type tag for a canonical message name.
pub fn type_tag(name: &str) -> u32 {
    let digest = blake3::hash(name.as_bytes());
    let b = digest.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Hard ceiling for a single chunk payload. The transport cannot carry a
/// larger answer in one exchange.
pub const MAX_CHUNK_SIZE: usize = 128 * 1024;

/// Smallest encoding of one header pair (two empty length-prefixed strings).
const MIN_HEADER_LEN: usize = 8;

// ── Request id ────────────────────────────────────────────────────────────────

/// Opaque 256-bit identifier tying a request, its response, and its body
/// stream together. Chosen by the caller; must be unique per exchange.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub [u8; 32]);

impl RequestId {
    pub fn random() -> Self {
        let mut id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 16 hex characters, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.short())
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// An HTTP request, minus its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMessage {
    pub id: RequestId,
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<(String, String)>,
}

/// Response head. When `no_body` is false the body is pulled with
/// `ChunkRequest`s keyed by the request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub http_version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub no_body: bool,
}

/// Pull the next part of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRequest {
    pub id: RequestId,
    /// Next expected sequence number, starting at 0.
    pub seqno: i32,
    /// Largest payload the requester will accept.
    pub max_chunk_size: i32,
}

/// One part of a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAnswer {
    pub data: Bytes,
    /// Set on the final chunk of a stream.
    pub last: bool,
}

impl ChunkAnswer {
    /// Whether this answer ends the stream for a request of `requested` bytes.
    pub fn is_terminal(&self, requested: usize) -> bool {
        self.last || self.data.len() < requested
    }
}

/// Reason code carried by an error answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    MalformedMessage = 1,
    UnexpectedMessage = 2,
    DuplicateStream = 3,
    UnknownStream = 4,
    SequenceMismatch = 5,
    SourceFailure = 6,
    SequenceOverflow = 7,
    UpstreamFailure = 8,
    UpstreamTimeout = 9,
    Internal = 10,
    ChunkTooLarge = 11,
}

impl TryFrom<u32> for ErrorCode {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => ErrorCode::MalformedMessage,
            2 => ErrorCode::UnexpectedMessage,
            3 => ErrorCode::DuplicateStream,
            4 => ErrorCode::UnknownStream,
            5 => ErrorCode::SequenceMismatch,
            6 => ErrorCode::SourceFailure,
            7 => ErrorCode::SequenceOverflow,
            8 => ErrorCode::UpstreamFailure,
            9 => ErrorCode::UpstreamTimeout,
            10 => ErrorCode::Internal,
            11 => ErrorCode::ChunkTooLarge,
            other => {
                return Err(WireError::OutOfRange {
                    field: "error code",
                    value: other as i64,
                })
            }
        })
    }
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MalformedMessage => "malformed_message",
            ErrorCode::UnexpectedMessage => "unexpected_message",
            ErrorCode::DuplicateStream => "duplicate_stream",
            ErrorCode::UnknownStream => "unknown_stream",
            ErrorCode::SequenceMismatch => "sequence_mismatch",
            ErrorCode::SourceFailure => "source_failure",
            ErrorCode::SequenceOverflow => "sequence_overflow",
            ErrorCode::UpstreamFailure => "upstream_failure",
            ErrorCode::UpstreamTimeout => "upstream_timeout",
            ErrorCode::Internal => "internal",
            ErrorCode::ChunkTooLarge => "chunk_too_large",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange-local failure reported to the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorAnswer {
    pub code: ErrorCode,
    pub reason: String,
}

impl ErrorAnswer {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Every message kind that can appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(RequestMessage),
    Response(ResponseMessage),
    ChunkRequest(ChunkRequest),
    Chunk(ChunkAnswer),
    Error(ErrorAnswer),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Request(_) => REQUEST_NAME,
            Message::Response(_) => RESPONSE_NAME,
            Message::ChunkRequest(_) => CHUNK_REQUEST_NAME,
            Message::Chunk(_) => CHUNK_NAME,
            Message::Error(_) => ERROR_NAME,
        }
    }

    /// Encode with its type tag.
    pub fn encode(&self) -> Bytes {
        let mut w = Writer::with_capacity(self.size_hint());
        w.put_u32(type_tag(self.name()));
        match self {
            Message::Request(m) => {
                w.put_fixed32(m.id.as_bytes());
                w.put_str(&m.method);
                w.put_str(&m.url);
                w.put_str(&m.http_version);
                put_headers(&mut w, &m.headers);
            }
            Message::Response(m) => {
                w.put_str(&m.http_version);
                w.put_u32(m.status as u32);
                w.put_str(&m.reason);
                put_headers(&mut w, &m.headers);
                w.put_bool(m.no_body);
            }
            Message::ChunkRequest(m) => {
                w.put_fixed32(m.id.as_bytes());
                w.put_i32(m.seqno);
                w.put_i32(m.max_chunk_size);
            }
            Message::Chunk(m) => {
                w.put_bytes(&m.data);
                w.put_bool(m.last);
            }
            Message::Error(m) => {
                w.put_u32(m.code as u32);
                w.put_str(&m.reason);
            }
        }
        w.finish()
    }

    fn size_hint(&self) -> usize {
        match self {
            Message::Chunk(m) => m.data.len() + 16,
            _ => 256,
        }
    }
}

impl From<ErrorAnswer> for Message {
    fn from(e: ErrorAnswer) -> Self {
        Message::Error(e)
    }
}

fn put_headers(w: &mut Writer, headers: &[(String, String)]) {
    w.put_count(headers.len());
    for (name, value) in headers {
        w.put_str(name);
        w.put_str(value);
    }
}

fn read_headers(r: &mut Reader<'_>) -> Result<Vec<(String, String)>, WireError> {
    let count = r.count("header", MIN_HEADER_LEN)?;
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let name = r.string("header name")?;
        let value = r.string("header value")?;
        headers.push((name, value));
    }
    Ok(headers)
}

// ── Decoders ──────────────────────────────────────────────────────────────────

fn decode_request(r: &mut Reader<'_>) -> Result<Message, WireError> {
    Ok(Message::Request(RequestMessage {
        id: RequestId(r.fixed32()?),
        method: r.string("method")?,
        url: r.string("url")?,
        http_version: r.string("http version")?,
        headers: read_headers(r)?,
    }))
}

fn decode_response(r: &mut Reader<'_>) -> Result<Message, WireError> {
    let http_version = r.string("http version")?;
    let status = r.u32()?;
    if !(100..=999).contains(&status) {
        return Err(WireError::OutOfRange {
            field: "status code",
            value: status as i64,
        });
    }
    Ok(Message::Response(ResponseMessage {
        http_version,
        status: status as u16,
        reason: r.string("reason")?,
        headers: read_headers(r)?,
        no_body: r.bool()?,
    }))
}

fn decode_chunk_request(r: &mut Reader<'_>) -> Result<Message, WireError> {
    let id = RequestId(r.fixed32()?);
    let seqno = r.i32()?;
    if seqno < 0 {
        return Err(WireError::OutOfRange {
            field: "seqno",
            value: seqno as i64,
        });
    }
    let max_chunk_size = r.i32()?;
    if max_chunk_size <= 0 {
        return Err(WireError::OutOfRange {
            field: "max chunk size",
            value: max_chunk_size as i64,
        });
    }
    Ok(Message::ChunkRequest(ChunkRequest {
        id,
        seqno,
        max_chunk_size,
    }))
}

fn decode_chunk(r: &mut Reader<'_>) -> Result<Message, WireError> {
    let data = Bytes::copy_from_slice(r.bytes()?);
    Ok(Message::Chunk(ChunkAnswer {
        data,
        last: r.bool()?,
    }))
}

fn decode_error(r: &mut Reader<'_>) -> Result<Message, WireError> {
    let code = ErrorCode::try_from(r.u32()?)?;
    Ok(Message::Error(ErrorAnswer {
        code,
        reason: r.string("reason")?,
    }))
}

// ── Schema registry ───────────────────────────────────────────────────────────

type Decoder = fn(&mut Reader<'_>) -> Result<Message, WireError>;

/// Immutable map from type tag to decoder.
///
/// Built once at startup and shared by reference; there is no way to
/// register a decoder after construction.
pub struct Schema {
    decoders: HashMap<u32, (&'static str, Decoder)>,
}

impl Schema {
    /// The standard meshgate message set.
    pub fn standard() -> Self {
        let entries: [(&'static str, Decoder); 5] = [
            (REQUEST_NAME, decode_request),
            (RESPONSE_NAME, decode_response),
            (CHUNK_REQUEST_NAME, decode_chunk_request),
            (CHUNK_NAME, decode_chunk),
            (ERROR_NAME, decode_error),
        ];
        let decoders = entries
            .into_iter()
            .map(|(name, decoder)| (type_tag(name), (name, decoder)))
            .collect();
        Self { decoders }
    }

    /// Decode one complete message. Trailing bytes are malformed.
    pub fn decode(&self, bytes: &[u8]) -> Result<Message, WireError> {
        if bytes.len() > MAX_MESSAGE_LEN + MAX_CHUNK_SIZE {
            return Err(WireError::TooLarge(bytes.len()));
        }
        let mut r = Reader::new(bytes);
        let tag = r.u32()?;
        let (_, decoder) = self
            .decoders
            .get(&tag)
            .ok_or(WireError::UnknownTag(tag))?;
        let message = decoder(&mut r)?;
        r.finish()?;
        Ok(message)
    }

    pub fn encode(&self, message: &Message) -> Bytes {
        message.encode()
    }

    /// Registered message names with their tags, sorted by name.
    pub fn entries(&self) -> Vec<(&'static str, u32)> {
        let mut out: Vec<_> = self
            .decoders
            .iter()
            .map(|(tag, (name, _))| (*name, *tag))
            .collect();
        out.sort();
        out
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::standard()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
