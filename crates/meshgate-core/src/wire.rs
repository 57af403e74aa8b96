//! meshgate wire format — the primitive codec every message is built from.
//!
//! These rules ARE the protocol. Two independent implementations must agree
//! byte for byte:
//!
//!   - fixed-width integers are little-endian
//!   - byte strings and text: u32 length, then the bytes (text is UTF-8)
//!   - lists: u32 element count, then the elements
//!   - booleans: one byte, 0x00 or 0x01; anything else is malformed
//!   - 32-byte fields (request ids) are written raw, no length prefix
//!
//! The reader never indexes past the end of its buffer. Every read checks
//! the remaining length first and fails with `WireError` instead.

use bytes::{BufMut, BytesMut};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Upper bound for a single encoded message. Anything claiming to be larger
/// is rejected before allocation.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Structural decoding failures. Every variant means "malformed message".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed message: truncated (needed {needed} bytes, {remaining} remaining)")]
    Truncated { needed: usize, remaining: usize },

    #[error("malformed message: {what} count {count} exceeds what {remaining} remaining bytes can hold")]
    CountOverflow {
        what: &'static str,
        count: u32,
        remaining: usize,
    },

    #[error("malformed message: unknown type tag 0x{0:08x}")]
    UnknownTag(u32),

    #[error("malformed message: invalid boolean byte 0x{0:02x}")]
    InvalidBool(u8),

    #[error("malformed message: {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("malformed message: {0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("malformed message: {field} out of range ({value})")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("malformed message: {0} bytes exceeds maximum message size")]
    TooLarge(usize),
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Append-only encoder over a `BytesMut`.
#[derive(Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn put_fixed32(&mut self, v: &[u8; 32]) {
        self.buf.put_slice(v);
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.put_u32_le(v.len() as u32);
        self.buf.put_slice(v);
    }

    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub fn put_count(&mut self, n: usize) {
        self.buf.put_u32_le(n as u32);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> bytes::Bytes {
        self.buf.freeze()
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Bounds-checked decoder over a borrowed buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn bool(&mut self) -> Result<bool, WireError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidBool(other)),
        }
    }

    pub fn fixed32(&mut self) -> Result<[u8; 32], WireError> {
        self.take_array()
    }

    pub fn bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn string(&mut self, field: &'static str) -> Result<String, WireError> {
        let raw = self.bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8(field))
    }

    /// Read a list count and verify the remaining buffer can hold `count`
    /// elements of at least `min_element_len` bytes each.
    pub fn count(&mut self, what: &'static str, min_element_len: usize) -> Result<usize, WireError> {
        let count = self.u32()?;
        let needed = (count as usize).saturating_mul(min_element_len.max(1));
        if needed > self.remaining() {
            return Err(WireError::CountOverflow {
                what,
                count,
                remaining: self.remaining(),
            });
        }
        Ok(count as usize)
    }

    /// Fail if any bytes are left over.
    pub fn finish(self) -> Result<(), WireError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes(self.buf.len()))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
