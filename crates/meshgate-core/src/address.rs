//! Node addresses — the 32-byte overlay identifier and its string form.
//!
//! String form (55 lowercase characters):
//!
//!   base32( 0x2d || address[32] || crc16_xmodem(0x2d || address)[2, BE] )
//!
//! The 35-byte buffer encodes to exactly 56 base32 characters. The first
//! character is fully determined by the version byte, so it is dropped.
//! Decoding restores it, so a decoded string always carries the version.

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Version byte prepended to every encoded address.
pub const ADDRESS_VERSION: u8 = 0x2d;

/// Raw address length in bytes.
pub const ADDRESS_LEN: usize = 32;

/// Length of the string form.
pub const ENCODED_LEN: usize = 55;

/// Base32 character the version byte always produces; dropped on encode.
const VERSION_PREFIX: char = 'F';

const BUFFER_LEN: usize = 1 + ADDRESS_LEN + 2;

/// Errors from decoding the string form of an address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("invalid address: expected {ENCODED_LEN} characters, got {0}")]
    BadLength(usize),

    #[error("invalid address: character {0:?} is outside the lowercase base32 alphabet")]
    BadCharacter(char),

    #[error("invalid address: unknown version byte 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("invalid address: checksum mismatch (expected 0x{expected:04x}, found 0x{found:04x})")]
    ChecksumMismatch { expected: u16, found: u16 },

    #[error("invalid address: {0}")]
    Encoding(String),
}

/// Table-driven CRC16/XMODEM over the version byte and the raw address.
fn checksum(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Encode a raw address into its checksummed, lowercase string form.
pub fn encode(raw: &[u8; ADDRESS_LEN]) -> String {
    let mut buf = [0u8; BUFFER_LEN];
    buf[0] = ADDRESS_VERSION;
    buf[1..=ADDRESS_LEN].copy_from_slice(raw);
    let crc = checksum(&buf[..=ADDRESS_LEN]);
    buf[ADDRESS_LEN + 1..].copy_from_slice(&crc.to_be_bytes());

    let encoded = BASE32.encode(&buf);
    encoded[1..].to_ascii_lowercase()
}

/// Decode the string form back into a raw address, verifying the checksum.
pub fn decode(s: &str) -> Result<[u8; ADDRESS_LEN], AddressError> {
    let len = s.chars().count();
    if len != ENCODED_LEN {
        return Err(AddressError::BadLength(len));
    }
    if let Some(c) = s
        .chars()
        .find(|c| !matches!(c, 'a'..='z' | '2'..='7'))
    {
        return Err(AddressError::BadCharacter(c));
    }

    let mut full = String::with_capacity(ENCODED_LEN + 1);
    full.push(VERSION_PREFIX);
    full.push_str(&s.to_ascii_uppercase());

    let buf = BASE32
        .decode(full.as_bytes())
        .map_err(|e| AddressError::Encoding(e.to_string()))?;
    if buf.len() != BUFFER_LEN {
        return Err(AddressError::BadLength(buf.len()));
    }
    if buf[0] != ADDRESS_VERSION {
        return Err(AddressError::UnknownVersion(buf[0]));
    }

    let expected = checksum(&buf[..=ADDRESS_LEN]);
    let found = u16::from_be_bytes([buf[ADDRESS_LEN + 1], buf[ADDRESS_LEN + 2]]);
    if expected != found {
        return Err(AddressError::ChecksumMismatch { expected, found });
    }

    let mut raw = [0u8; ADDRESS_LEN];
    raw.copy_from_slice(&buf[1..=ADDRESS_LEN]);
    Ok(raw)
}

/// A 32-byte overlay node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress([u8; ADDRESS_LEN]);

impl NodeAddress {
    pub const fn from_bytes(raw: [u8; ADDRESS_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Derive an address from arbitrary key material (BLAKE3 digest).
    pub fn derive(material: &[u8]) -> Self {
        Self(*blake3::hash(material).as_bytes())
    }

    /// First 8 hex characters, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<[u8; ADDRESS_LEN]> for NodeAddress {
    fn from(raw: [u8; ADDRESS_LEN]) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(&self.0))
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({})", self.short())
    }
}

impl FromStr for NodeAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s).map(Self)
    }
}

impl Serialize for NodeAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeAddress {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
