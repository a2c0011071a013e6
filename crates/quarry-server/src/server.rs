//! File server — replicates writes to every peer and fetches misses from
//! the network.
//!
//! ```text
//!   store(key, data) ──▶ local Store[hash(key)]
//!                    └─▶ per peer: [StoreFile][stream header][IV ‖ ciphertext]
//!
//!   get(key) ──▶ local hit? serve
//!            └─▶ GetFile to all peers, then per peer: claim stream ─▶ decrypt ─▶ Store
//! ```
//!
//! Objects travel encrypted and rest in cleartext. Every node names an
//! object by `hash_key(key)`, so the key inside a message is the store key
//! on both ends.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use quarry_core::crypto::{self, hash_key};
use quarry_core::wire::IV_LEN;
use quarry_core::{Codec, EncryptionKey, Message, Store, StoreOpts};
use quarry_net::{Peer, TcpTransport, TcpTransportOpts};

use crate::error::ServerError;
use crate::registry::PeerRegistry;

pub struct FileServerOpts {
    /// Shared by every node this one replicates with.
    pub enc_key: EncryptionKey,
    pub store: StoreOpts,
    /// The file server installs its own peer hook; any hook set here is
    /// replaced.
    pub transport: TcpTransportOpts,
    /// Dialed once on start. Empty entries are skipped.
    pub bootstrap_nodes: Vec<String>,
}

pub struct FileServer {
    pub(crate) enc_key: EncryptionKey,
    pub(crate) store: Store,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) registry: PeerRegistry,
    transport: Arc<TcpTransport>,
    bootstrap_nodes: Vec<String>,
    stop: watch::Sender<bool>,
}

impl FileServer {
    pub fn new(opts: FileServerOpts) -> Self {
        let registry = PeerRegistry::new();
        let mut transport_opts = opts.transport;
        transport_opts.hook = Some(Arc::new(registry.clone()));
        let codec = transport_opts.codec.clone();
        let (stop, _) = watch::channel(false);

        Self {
            enc_key: opts.enc_key,
            store: Store::new(opts.store),
            codec,
            registry,
            transport: Arc::new(TcpTransport::new(transport_opts)),
            bootstrap_nodes: opts.bootstrap_nodes,
            stop,
        }
    }

    /// Listen, dial the bootstrap nodes, and run the dispatch loop until
    /// [`FileServer::stop`]. Closes the transport on the way out.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut inbound = self.transport.consume().ok_or(ServerError::AlreadyStarted)?;
        let addr = self.transport.listen_and_accept().await?;
        self.bootstrap_network();
        tracing::info!(%addr, root = %self.store.root().display(), "file server started");

        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                _ = stopped(&mut stop) => {
                    tracing::info!(%addr, "file server stopping");
                    break;
                }

                envelope = inbound.recv() => {
                    let Some(envelope) = envelope else { break };
                    let (from, kind) = (envelope.from, envelope.message.kind());
                    if let Err(e) = self.handle_message(envelope).await {
                        tracing::warn!(peer = %from, kind, error = %e, "message handling failed");
                    }
                }
            }
        }

        self.transport.close()?;
        Ok(())
    }

    /// End the dispatch loop. Safe to call before `start` or more than once.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Dial every bootstrap node in the background. Failures are logged
    /// and not retried.
    pub fn bootstrap_network(&self) {
        for addr in self.bootstrap_nodes.iter().filter(|a| !a.trim().is_empty()) {
            let transport = self.transport.clone();
            let addr = addr.trim().to_string();
            tokio::spawn(async move {
                tracing::info!(peer = %addr, "dialing bootstrap node");
                if let Err(e) = transport.dial(&addr).await {
                    tracing::warn!(peer = %addr, error = %e, "bootstrap dial failed");
                }
            });
        }
    }

    // ── Store ────────────────────────────────────────────────────────────────

    /// Write `data` locally under `key` and replicate it to every peer.
    ///
    /// Returns the bytes written locally. A peer that fails is logged and
    /// skipped; it never fails the call.
    pub async fn store<R>(&self, key: &str, mut data: R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)
            .await
            .map_err(ServerError::Input)?;

        let object = hash_key(key);
        let n = self.store.write(&object, &buf[..]).await?;
        tracing::info!(key, bytes = n, "stored locally");

        for peer in self.registry.snapshot() {
            match self.replicate(&peer, &object, &buf).await {
                Ok(sent) => {
                    tracing::info!(key, peer = %peer.remote_addr(), bytes = sent, "replicated")
                }
                Err(e) => {
                    tracing::warn!(key, peer = %peer.remote_addr(), error = %e, "replication failed")
                }
            }
        }
        Ok(n)
    }

    /// Announce and stream one object to one peer, holding its writer for
    /// the whole unit.
    async fn replicate(&self, peer: &Peer, object: &str, data: &[u8]) -> Result<u64, ServerError> {
        let stream_id = rand::random::<u64>();
        let size = data.len() as u64 + IV_LEN as u64;
        let announce = self.codec.encode(&Message::StoreFile {
            key: object.to_string(),
            size,
            stream_id,
        })?;

        let mut writer = peer.writer().await;
        writer.control(&announce).await?;
        writer.stream_header(stream_id, size).await?;
        let sent = crypto::copy_encrypt(&self.enc_key, &mut &data[..], &mut writer).await?;
        Ok(sent)
    }

    // ── Get ──────────────────────────────────────────────────────────────────

    /// Open `key`, fetching it from the network first if it is not here.
    ///
    /// Peers are asked all at once and read one after another until one
    /// delivers. There is no timeout: a peer that holds nothing stays
    /// silent, and `get` waits on it until it disconnects. Dropping the
    /// future gives up on the request; answers still on their way are
    /// drained.
    pub async fn get(&self, key: &str) -> Result<(u64, File), ServerError> {
        let object = hash_key(key);
        if self.store.has(&object).await {
            tracing::info!(key, "serving from local disk");
            return Ok(self.store.read(&object).await?);
        }

        let peers = self.registry.snapshot();
        if peers.is_empty() {
            return Err(ServerError::NotFound(key.to_string()));
        }
        tracing::info!(key, peers = peers.len(), "not held locally, fetching from network");

        let request_id = rand::random::<u64>();
        let request = self.codec.encode(&Message::GetFile {
            key: object.clone(),
            request_id,
        })?;

        // Claims go in before the request, so every answer has a reader
        // or is drained once its claim is dropped.
        let mut asked = Vec::with_capacity(peers.len());
        for peer in peers {
            let incoming = peer.claim_stream(request_id);
            match peer.send_control(&request).await {
                Ok(()) => asked.push((peer, incoming)),
                Err(e) => {
                    tracing::warn!(key, peer = %peer.remote_addr(), error = %e, "request failed")
                }
            }
        }

        let mut answered = false;
        for (peer, incoming) in asked {
            let partial = PartialObject::new(&self.store, &object);
            match self.store.write_decrypt(&self.enc_key, &object, incoming).await {
                Ok(n) => {
                    partial.keep();
                    tracing::info!(key, peer = %peer.remote_addr(), bytes = n, "fetched from network");
                    answered = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(key, peer = %peer.remote_addr(), error = %e, "fetch failed");
                    self.store.discard(&object).await?;
                    partial.keep();
                }
            }
        }

        if !answered {
            return Err(ServerError::NotFound(key.to_string()));
        }
        Ok(self.store.read(&object).await?)
    }

    // ── Local helpers ────────────────────────────────────────────────────────

    pub async fn has(&self, key: &str) -> bool {
        self.store.has(&hash_key(key)).await
    }

    /// Remove the local copy only. Peers keep theirs.
    pub async fn delete_local(&self, key: &str) -> Result<(), ServerError> {
        Ok(self.store.delete(&hash_key(key)).await?)
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.registry.addrs()
    }

    /// Listen address; the bound one once started.
    pub fn addr(&self) -> String {
        self.transport.addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn local_store(&self) -> &Store {
        &self.store
    }
}

/// An object being fetched. Discarded in the background if the fetch is
/// dropped before `keep`.
struct PartialObject<'a> {
    store: &'a Store,
    key: &'a str,
    kept: bool,
}

impl<'a> PartialObject<'a> {
    fn new(store: &'a Store, key: &'a str) -> Self {
        Self {
            store,
            key,
            kept: false,
        }
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for PartialObject<'_> {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let (store, key) = (self.store.clone(), self.key.to_string());
        handle.spawn(async move {
            if let Err(e) = store.discard(&key).await {
                tracing::warn!(key = %key, error = %e, "failed to discard partial object");
            }
        });
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
