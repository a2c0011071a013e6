//! Quarry wire format — what travels on a peer connection.
//!
//! Every logical unit starts with a single tag byte:
//!
//!   0x1  control: a codec-encoded `Message`, no length prefix
//!   0x2  stream:  a `StreamHeader`, then `length` bytes of [IV][ciphertext]
//!
//! There is no connection-level versioning. `VersionHandshake` in
//! quarry-net is the only place a protocol version is checked, and only
//! when a node opts into it.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Tags ──────────────────────────────────────────────────────────────────────

pub const TAG_CONTROL: u8 = 0x1;
pub const TAG_STREAM: u8 = 0x2;

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    /// A control message follows.
    Control = TAG_CONTROL,
    /// A raw stream follows.
    Stream = TAG_STREAM,
}

impl TryFrom<u8> for Tag {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            TAG_CONTROL => Ok(Tag::Control),
            TAG_STREAM => Ok(Tag::Stream),
            other => Err(other),
        }
    }
}

// ── Limits ────────────────────────────────────────────────────────────────────

/// Capacity of the control receive buffer. A control frame that has not
/// decoded within this many bytes is rejected and the connection dropped.
pub const MAX_CONTROL_LEN: usize = 2048;

/// Length of the plaintext IV the stream cipher writes ahead of ciphertext.
/// Every stream leg is exactly `IV_LEN` bytes longer than its payload.
pub const IV_LEN: usize = 16;

// ── Stream Header ─────────────────────────────────────────────────────────────

/// Follows a stream tag byte.
///
/// `stream_id` matches the body to whoever is waiting for it: the
/// `stream_id` of a `StoreFile` announce, or the `request_id` of a
/// `GetFile` request. `length` counts IV + ciphertext.
///
/// Wire size: 16 bytes, both fields little-endian.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct StreamHeader {
    pub stream_id: U64<LittleEndian>,
    pub length: U64<LittleEndian>,
}

assert_eq_size!(StreamHeader, [u8; 16]);

pub const STREAM_HEADER_LEN: usize = std::mem::size_of::<StreamHeader>();

impl StreamHeader {
    pub fn new(stream_id: u64, length: u64) -> Self {
        Self {
            stream_id: U64::new(stream_id),
            length: U64::new(length),
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id.get()
    }

    pub fn length(&self) -> u64 {
        self.length.get()
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Magic bytes exchanged by the version handshake.
pub const HANDSHAKE_MAGIC: [u8; 4] = *b"QRRY";

/// Protocol version carried by the version handshake.
pub const PROTOCOL_VERSION: u8 = 1;
