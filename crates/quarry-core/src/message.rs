//! Control messages and the codec that puts them on the wire.
//!
//! The message set is closed. Adding a variant is a protocol change: both
//! ends must know it before either sends it.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A control message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// The sender is about to stream a file on this connection.
    ///
    /// `size` is exactly the length of the stream body that follows
    /// (IV + ciphertext). `stream_id` names that body.
    StoreFile {
        key: String,
        size: u64,
        stream_id: u64,
    },
    /// The sender wants a file. A peer holding it answers with a stream
    /// whose id is `request_id`; a peer without it stays silent.
    GetFile { key: String, request_id: u64 },
}

impl Message {
    /// The object key this message is about.
    pub fn key(&self) -> &str {
        match self {
            Message::StoreFile { key, .. } | Message::GetFile { key, .. } => key,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::StoreFile { .. } => "store_file",
            Message::GetFile { .. } => "get_file",
        }
    }
}

/// A decoded control message together with the address it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: SocketAddr,
    pub message: Message,
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Encodes and decodes control messages.
///
/// Control frames carry no length prefix, so `decode` must tell where a
/// message ends: it returns the message plus the number of bytes it used,
/// or `Ok(None)` when `buf` holds only a prefix of one.
pub trait Codec: Send + Sync {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, buf: &[u8]) -> Result<Option<(Message, usize)>, CodecError>;
}

/// Self-delimiting JSON: a message ends at its closing brace.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(CodecError::Encode)
    }

    fn decode(&self, buf: &[u8]) -> Result<Option<(Message, usize)>, CodecError> {
        let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Message>();
        match stream.next() {
            Some(Ok(msg)) => Ok(Some((msg, stream.byte_offset()))),
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(CodecError::Decode(e)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode control message: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode control message: {0}")]
    Decode(serde_json::Error),
}
