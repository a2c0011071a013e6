//! Connection handshakes.
//!
//! A handshake runs on the raw socket right after connect/accept, before
//! the connection is split and before any peer hook sees it. An error
//! drops the connection.
//!
//! Two ship with the crate:
//!
//!   NopHandshake      accepts everything (the default)
//!   VersionHandshake  both sides send `MAGIC ‖ VERSION`; the dialer
//!                     writes first, the acceptor reads first

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use quarry_core::wire::{HANDSHAKE_MAGIC, PROTOCOL_VERSION};

/// Runs once per connection, in either direction.
pub trait Handshake: Send + Sync {
    fn handshake<'a>(
        &'a self,
        stream: &'a mut TcpStream,
        outbound: bool,
    ) -> BoxFuture<'a, Result<(), HandshakeError>>;
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad handshake magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u8, theirs: u8 },
}

// ── Nop ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct NopHandshake;

impl Handshake for NopHandshake {
    fn handshake<'a>(
        &'a self,
        _stream: &'a mut TcpStream,
        _outbound: bool,
    ) -> BoxFuture<'a, Result<(), HandshakeError>> {
        Box::pin(async { Ok(()) })
    }
}

// ── Version ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct VersionHandshake;

const HELLO_LEN: usize = 5;

fn hello() -> [u8; HELLO_LEN] {
    let mut buf = [0u8; HELLO_LEN];
    buf[..4].copy_from_slice(&HANDSHAKE_MAGIC);
    buf[4] = PROTOCOL_VERSION;
    buf
}

fn check_hello(buf: &[u8; HELLO_LEN]) -> Result<(), HandshakeError> {
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&buf[..4]);
    if magic != HANDSHAKE_MAGIC {
        return Err(HandshakeError::BadMagic(magic));
    }
    if buf[4] != PROTOCOL_VERSION {
        return Err(HandshakeError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: buf[4],
        });
    }
    Ok(())
}

impl Handshake for VersionHandshake {
    fn handshake<'a>(
        &'a self,
        stream: &'a mut TcpStream,
        outbound: bool,
    ) -> BoxFuture<'a, Result<(), HandshakeError>> {
        Box::pin(async move {
            let mut theirs = [0u8; HELLO_LEN];
            if outbound {
                stream.write_all(&hello()).await?;
                stream.read_exact(&mut theirs).await?;
                check_hello(&theirs)
            } else {
                stream.read_exact(&mut theirs).await?;
                check_hello(&theirs)?;
                stream.write_all(&hello()).await?;
                Ok(())
            }
        })
    }
}
