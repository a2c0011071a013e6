//! Peer handle — one live connection as the rest of the node sees it.
//!
//! The connection task owns the read half. A `Peer` is the cheap, cloneable
//! handle to everything else: the write half behind a lock, and the table
//! incoming stream bodies are parked in until someone claims them.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, MutexGuard};
use zerocopy::AsBytes;

use quarry_core::wire::{StreamHeader, TAG_CONTROL, TAG_STREAM};

use crate::stream::{IncomingStream, StreamTable};

#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    remote: SocketAddr,
    outbound: bool,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    streams: StreamTable,
}

impl Peer {
    pub(crate) fn new(
        remote: SocketAddr,
        outbound: bool,
        writer: OwnedWriteHalf,
        streams: StreamTable,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                remote,
                outbound,
                writer: Mutex::new(BufWriter::new(writer)),
                streams,
            }),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    /// True if this node dialed the connection.
    pub fn is_outbound(&self) -> bool {
        self.inner.outbound
    }

    /// Lock the connection for writing.
    ///
    /// Everything written through the guard reaches the wire as one
    /// uninterrupted sequence; other writers wait until it is dropped.
    pub async fn writer(&self) -> PeerWriter<'_> {
        PeerWriter {
            inner: self.inner.writer.lock().await,
        }
    }

    /// Write raw bytes and flush.
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut w = self.writer().await;
        w.write_all(bytes).await?;
        w.flush().await
    }

    /// Write one control frame (tag + encoded message) and flush.
    pub async fn send_control(&self, payload: &[u8]) -> io::Result<()> {
        let mut w = self.writer().await;
        w.control(payload).await?;
        w.flush().await
    }

    /// The body of stream `id` on this connection. See [`StreamTable::claim`].
    pub fn claim_stream(&self, id: u64) -> IncomingStream {
        self.inner.streams.claim(id)
    }

    pub(crate) fn streams(&self) -> &StreamTable {
        &self.inner.streams
    }

    pub fn same_connection(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("remote", &self.inner.remote)
            .field("outbound", &self.inner.outbound)
            .finish()
    }
}

// ── Writer guard ──────────────────────────────────────────────────────────────

/// Exclusive write access to one peer connection.
///
/// Implements `AsyncWrite`, so a stream body can be copied straight in
/// after [`PeerWriter::stream_header`]. Buffered: call `flush` when done.
pub struct PeerWriter<'a> {
    inner: MutexGuard<'a, BufWriter<OwnedWriteHalf>>,
}

impl PeerWriter<'_> {
    pub async fn control(&mut self, payload: &[u8]) -> io::Result<()> {
        self.inner.write_u8(TAG_CONTROL).await?;
        self.inner.write_all(payload).await
    }

    /// Tag + header. Exactly `length` body bytes must follow.
    pub async fn stream_header(&mut self, stream_id: u64, length: u64) -> io::Result<()> {
        self.inner.write_u8(TAG_STREAM).await?;
        self.inner
            .write_all(StreamHeader::new(stream_id, length).as_bytes())
            .await
    }
}

impl AsyncWrite for PeerWriter<'_> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}
