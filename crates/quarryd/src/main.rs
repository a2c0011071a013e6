//! quarryd — Quarry storage node.
//!
//! Usage: quarryd [--listen ADDR] [--peer ADDR]...
//!
//! Arguments override the config file and QUARRY_* environment.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use quarry_core::config::{HandshakeKind, NodeConfig};
use quarry_core::crypto::generate_id;
use quarry_core::StoreOpts;
use quarry_net::{NopHandshake, TcpTransportOpts, VersionHandshake};
use quarry_server::{FileServer, FileServerOpts};

/// Command-line overrides.
#[derive(Debug, Default, PartialEq)]
struct Args {
    listen: Option<String>,
    peers: Vec<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => parsed.listen = Some(args.next().context("--listen needs an address")?),
            "--peer" => parsed.peers.push(args.next().context("--peer needs an address")?),
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(parsed)
}

fn apply_args(config: &mut NodeConfig, args: Args) {
    if let Some(listen) = args.listen {
        config.network.listen_addr = listen;
    }
    if !args.peers.is_empty() {
        config.network.bootstrap_nodes = args.peers;
    }
}

fn server_opts(config: &NodeConfig) -> Result<FileServerOpts> {
    let enc_key = config.encryption_key().context("invalid encryption key")?;
    if config.security.encryption_key.is_none() {
        tracing::warn!("no encryption_key configured; generated a key only this process knows");
    }

    let mut transport = TcpTransportOpts::new(config.network.listen_addr.clone());
    transport.handshake = match config.network.handshake {
        HandshakeKind::Nop => Arc::new(NopHandshake),
        HandshakeKind::Version => Arc::new(VersionHandshake),
    };

    Ok(FileServerOpts {
        enc_key,
        store: StoreOpts {
            root: config.storage.root.clone(),
            instance_id: config.storage.instance_dir.then(generate_id),
            ..StoreOpts::default()
        },
        transport,
        bootstrap_nodes: config.network.bootstrap_nodes.clone(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = parse_args(std::env::args().skip(1))?;

    if let Err(e) = NodeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = NodeConfig::load().context("failed to load config")?;
    apply_args(&mut config, args);

    let server = Arc::new(FileServer::new(server_opts(&config)?));
    tracing::info!(
        listen = %config.network.listen_addr,
        peers = config.network.bootstrap_nodes.len(),
        "quarryd starting"
    );

    tokio::spawn({
        let server = server.clone();
        async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutting down");
            server.stop();
        }
    });

    server.start().await.context("file server failed")?;
    tracing::info!("quarryd stopped");
    Ok(())
}
