use std::io;
use std::net::SocketAddr;

use quarry_core::crypto::CryptoError;
use quarry_core::message::CodecError;
use quarry_core::store::StoreError;
use quarry_net::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("peer write failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to read input: {0}")]
    Input(io::Error),
    #[error("message from unregistered peer {0}")]
    UnknownPeer(SocketAddr),
    #[error("stream for {key} carried {got} bytes, announced {expected}")]
    SizeMismatch { key: String, expected: u64, got: u64 },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid object key {0:?}")]
    BadKey(String),
    #[error("file server already started")]
    AlreadyStarted,
}
