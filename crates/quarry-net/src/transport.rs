//! TCP transport — accepts and dials peer connections and runs one reader
//! task per connection.
//!
//! ```text
//!   socket ──read──▶ connection task ──┬─ control ─▶ inbound channel (cap 1) ─▶ consumer
//!                                      └─ stream  ─▶ StreamTable[id] ─▶ IncomingStream
//!
//!   Peer (cloneable) ──lock──▶ write half
//! ```
//!
//! The connection task is the socket's only reader. Control frames are
//! decoded and pushed into the inbound channel, which holds at most one
//! message: a slow consumer stalls the reader instead of losing messages.
//! Stream bodies go to whoever claimed their id.
//!
//! Any read error, unknown tag, undecodable or oversized control frame
//! ends the connection. On the way out the stream table is closed and the
//! disconnect hook runs, whatever the cause.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use zerocopy::FromBytes;

use quarry_core::message::CodecError;
use quarry_core::wire::{StreamHeader, Tag, MAX_CONTROL_LEN, STREAM_HEADER_LEN};
use quarry_core::{Codec, Envelope, JsonCodec, Message};

use crate::handshake::{Handshake, HandshakeError, NopHandshake};
use crate::peer::Peer;
use crate::stream::StreamTable;

/// Read buffer per connection; also the largest chunk a stream body is
/// forwarded in.
const READ_BUF_LEN: usize = 32 * 1024;

// ── Hooks ─────────────────────────────────────────────────────────────────────

/// Lifecycle callbacks for connections that pass the handshake.
pub trait PeerHook: Send + Sync {
    /// Runs before the connection's read loop starts. An error drops the
    /// connection and `on_disconnect` is not called for it.
    fn on_connect(&self, peer: &Peer) -> Result<(), TransportError>;

    /// Runs exactly once for every connection `on_connect` accepted, when
    /// that connection ends for any reason.
    fn on_disconnect(&self, peer: &Peer);
}

/// Calls `on_disconnect` when the connection task exits, however it exits.
struct Registration {
    hook: Arc<dyn PeerHook>,
    peer: Peer,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hook.on_disconnect(&self.peer);
    }
}

struct CloseStreams(StreamTable);

impl Drop for CloseStreams {
    fn drop(&mut self) {
        self.0.close();
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, io::Error),
    #[error("failed to dial {0}: {1}")]
    Dial(String, io::Error),
    #[error("connection i/o: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("control frame did not decode within {0} bytes")]
    OversizedControl(usize),
    #[error("peer rejected: {0}")]
    Rejected(String),
    #[error("inbound channel closed")]
    InboundClosed,
    #[error("transport already closed")]
    AlreadyClosed,
}

// ── Options ───────────────────────────────────────────────────────────────────

pub struct TcpTransportOpts {
    /// `host:port`; port 0 = OS-assigned.
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    pub codec: Arc<dyn Codec>,
    pub hook: Option<Arc<dyn PeerHook>>,
}

impl TcpTransportOpts {
    /// Nop handshake, JSON codec, no hook.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(NopHandshake),
            codec: Arc::new(JsonCodec),
            hook: None,
        }
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// State every connection task shares.
struct Shared {
    handshake: Arc<dyn Handshake>,
    codec: Arc<dyn Codec>,
    hook: Option<Arc<dyn PeerHook>>,
    inbound: mpsc::Sender<Envelope>,
    shutdown: watch::Sender<bool>,
}

pub struct TcpTransport {
    listen_addr: String,
    local_addr: OnceLock<SocketAddr>,
    shared: Arc<Shared>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (inbound, inbound_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        Self {
            listen_addr: opts.listen_addr,
            local_addr: OnceLock::new(),
            shared: Arc::new(Shared {
                handshake: opts.handshake,
                codec: opts.codec,
                hook: opts.hook,
                inbound,
                shutdown,
            }),
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Bind the listen address and start accepting in the background.
    /// Returns the bound address.
    pub async fn listen_and_accept(&self) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| TransportError::Bind(self.listen_addr.clone(), e))?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);

        tracing::info!(%addr, "TCP transport listening");
        tokio::spawn(accept_loop(listener, self.shared.clone()));
        Ok(addr)
    }

    /// Connect to `addr` and run the connection like an accepted one.
    ///
    /// Returns once TCP is up; the handshake and hook run in the
    /// connection task.
    pub async fn dial(&self, addr: &str) -> Result<(), TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Dial(addr.to_string(), e))?;
        let remote = stream.peer_addr()?;

        tracing::debug!(peer = %remote, "dialed");
        tokio::spawn(handle_conn(self.shared.clone(), stream, remote, true));
        Ok(())
    }

    /// The inbound message stream. Only the first call gets it.
    pub fn consume(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Stop accepting and end every connection this transport runs.
    ///
    /// Fails with `AlreadyClosed` on every call after the first.
    pub fn close(&self) -> Result<(), TransportError> {
        if self.shared.shutdown.send_replace(true) {
            return Err(TransportError::AlreadyClosed);
        }
        tracing::info!(addr = %self.addr(), "TCP transport closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// The bound address once listening, else the configured one.
    pub fn addr(&self) -> String {
        match self.local_addr.get() {
            Some(addr) => addr.to_string(),
            None => self.listen_addr.clone(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }
}

async fn wait_closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = wait_closed(&mut shutdown) => {
                tracing::debug!("accept loop shutting down");
                return;
            }

            result = listener.accept() => {
                let (stream, remote) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "TCP accept error");
                        continue;
                    }
                };
                tracing::debug!(peer = %remote, "accepted");
                tokio::spawn(handle_conn(shared.clone(), stream, remote, false));
            }
        }
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

async fn handle_conn(shared: Arc<Shared>, stream: TcpStream, remote: SocketAddr, outbound: bool) {
    let mut shutdown = shared.shutdown.subscribe();
    let result = tokio::select! {
        r = run_conn(&shared, stream, remote, outbound) => r,
        _ = wait_closed(&mut shutdown) => Ok(()),
    };
    match result {
        Ok(()) => tracing::debug!(peer = %remote, "connection closed"),
        Err(e) => tracing::warn!(peer = %remote, error = %e, "dropping peer connection"),
    }
}

async fn run_conn(
    shared: &Shared,
    mut stream: TcpStream,
    remote: SocketAddr,
    outbound: bool,
) -> Result<(), TransportError> {
    shared.handshake.handshake(&mut stream, outbound).await?;
    stream.set_nodelay(true)?;

    let (read_half, write_half) = stream.into_split();
    let streams = StreamTable::new();
    let peer = Peer::new(remote, outbound, write_half, streams.clone());

    let _registration = match &shared.hook {
        Some(hook) => {
            hook.on_connect(&peer)?;
            Some(Registration {
                hook: hook.clone(),
                peer: peer.clone(),
            })
        }
        None => None,
    };
    let _close = CloseStreams(streams.clone());
    tracing::info!(peer = %remote, outbound, "peer connected");

    let mut conn = Connection {
        remote,
        reader: BufReader::with_capacity(READ_BUF_LEN, read_half),
        codec: shared.codec.as_ref(),
        inbound: &shared.inbound,
        streams,
    };
    conn.read_loop().await
}

struct Connection<'a> {
    remote: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    codec: &'a dyn Codec,
    inbound: &'a mpsc::Sender<Envelope>,
    streams: StreamTable,
}

impl Connection<'_> {
    async fn read_loop(&mut self) -> Result<(), TransportError> {
        loop {
            let tag = match self.reader.read_u8().await {
                Ok(tag) => tag,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            match Tag::try_from(tag).map_err(TransportError::UnknownTag)? {
                Tag::Control => {
                    let message = self.read_control().await?;
                    tracing::debug!(
                        peer = %self.remote,
                        kind = message.kind(),
                        "control frame"
                    );
                    let envelope = Envelope {
                        from: self.remote,
                        message,
                    };
                    self.inbound
                        .send(envelope)
                        .await
                        .map_err(|_| TransportError::InboundClosed)?;
                }
                Tag::Stream => self.read_stream().await?,
            }
        }
    }

    /// Decode one control message straight off the read buffer, consuming
    /// exactly its bytes.
    async fn read_control(&mut self) -> Result<Message, TransportError> {
        let mut frame: Vec<u8> = Vec::new();
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            let prev = frame.len();
            let take = available.len().min(MAX_CONTROL_LEN - prev);
            frame.extend_from_slice(&available[..take]);

            match self.codec.decode(&frame)? {
                Some((message, used)) => {
                    self.reader.consume(used - prev);
                    return Ok(message);
                }
                None if frame.len() >= MAX_CONTROL_LEN => {
                    return Err(TransportError::OversizedControl(MAX_CONTROL_LEN));
                }
                None => self.reader.consume(take),
            }
        }
    }

    /// Forward one stream body to its claimant, or drain it if nobody
    /// will read it.
    async fn read_stream(&mut self) -> Result<(), TransportError> {
        let mut raw = [0u8; STREAM_HEADER_LEN];
        self.reader.read_exact(&mut raw).await?;
        let header = StreamHeader::read_from(&raw[..])
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad stream header"))?;
        let (id, length) = (header.stream_id(), header.length());

        let mut sink = self.streams.open(id);
        if sink.is_none() {
            tracing::warn!(peer = %self.remote, stream_id = id, "duplicate stream id, discarding body");
        }

        let mut remaining = length;
        while remaining > 0 {
            let available = match self.reader.fill_buf().await {
                Ok([]) => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-stream",
                )),
                other => other,
            };
            let available = match available {
                Ok(buf) => buf,
                Err(e) => {
                    if let Some(tx) = sink.take() {
                        let kind = e.kind();
                        tokio::spawn(async move {
                            let _ = tx.send(Err(io::Error::new(kind, "stream truncated"))).await;
                        });
                    }
                    return Err(e.into());
                }
            };

            let n = (available.len() as u64).min(remaining) as usize;
            let chunk = Bytes::copy_from_slice(&available[..n]);
            self.reader.consume(n);
            remaining -= n as u64;

            if let Some(tx) = &sink {
                if tx.send(Ok(chunk)).await.is_err() {
                    tracing::debug!(peer = %self.remote, stream_id = id, "stream reader gone, draining");
                    sink = None;
                }
            }
        }

        tracing::debug!(peer = %self.remote, stream_id = id, length, "stream forwarded");
        Ok(())
    }
}
