//! Quarry integration test harness.
//!
//! Every test runs real nodes in-process over loopback TCP. Nodes listen on
//! 127.0.0.1:0 and store under a fresh directory in the system temp dir,
//! so tests never share ports or files.
//!
//!   cargo test --test integration
//!
//! Each test shuts down the nodes it starts.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

use quarry_core::{EncryptionKey, StoreOpts};
use quarry_net::{Handshake, NopHandshake, TcpTransportOpts};
use quarry_server::{FileServer, FileServerOpts, ServerError};

mod failures;
mod network;
mod replication;

// ── Harness ───────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_root() -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("quarry-it-{}-{}", std::process::id(), id));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// One key for every node in a test, as a real deployment would configure.
pub fn network_key() -> EncryptionKey {
    EncryptionKey::from_bytes([0x5A; 32])
}

/// Poll `f` every 10ms for up to 5s.
pub async fn wait_until(what: &str, mut f: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..500 {
        if f() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {what}")
}

/// A running file server and its dispatch task.
pub struct Node {
    pub server: Arc<FileServer>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl Node {
    pub async fn start(bootstrap: &[&Node]) -> Result<Node> {
        Self::start_with(network_key(), Arc::new(NopHandshake), bootstrap).await
    }

    pub async fn start_with(
        enc_key: EncryptionKey,
        handshake: Arc<dyn Handshake>,
        bootstrap: &[&Node],
    ) -> Result<Node> {
        let mut transport = TcpTransportOpts::new("127.0.0.1:0");
        transport.handshake = handshake;

        let server = Arc::new(FileServer::new(FileServerOpts {
            enc_key,
            store: StoreOpts {
                root: temp_root(),
                ..StoreOpts::default()
            },
            transport,
            bootstrap_nodes: bootstrap.iter().map(|n| n.addr()).collect(),
        }));

        let task = tokio::spawn({
            let server = server.clone();
            async move { server.start().await }
        });

        wait_until("node listening", || server.local_addr().is_some()).await?;
        Ok(Node { server, task })
    }

    pub fn addr(&self) -> String {
        self.server.addr()
    }

    pub fn peer_count(&self) -> usize {
        self.server.peers().len()
    }

    /// Fetch `key` through the server and return its contents.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let (size, mut file) = self.server.get(key).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        if buf.len() as u64 != size {
            bail!("{key}: read {} bytes, size said {size}", buf.len());
        }
        Ok(buf)
    }

    /// Wait until a local copy of `key` holds `len` bytes, then return it.
    /// Never asks the network.
    pub async fn wait_for_local(&self, key: &str, len: usize) -> Result<Vec<u8>> {
        for _ in 0..500 {
            if self.server.has(key).await {
                let data = self.get(key).await?;
                if data.len() == len {
                    return Ok(data);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        bail!("{key} never arrived in full at {}", self.addr())
    }

    pub async fn shutdown(self) -> Result<()> {
        self.server.stop();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .context("dispatch loop did not stop")??
            .context("file server failed")?;
        self.server.local_store().clear().await?;
        Ok(())
    }
}

/// Start `a` and a node `b` that bootstraps to it; wait until they see
/// each other.
pub async fn connected_pair() -> Result<(Node, Node)> {
    let a = Node::start(&[]).await?;
    let b = Node::start(&[&a]).await?;
    wait_until("pair connected", || a.peer_count() == 1 && b.peer_count() == 1).await?;
    Ok((a, b))
}
