use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use quarry_core::wire::{HANDSHAKE_MAGIC, PROTOCOL_VERSION};
use quarry_net::VersionHandshake;

use crate::*;

#[tokio::test]
async fn test_bootstrap_registers_both_sides() {
    let (a, b) = connected_pair().await.unwrap();

    let b_seen_by_a = a.server.peers()[0];
    let a_addr = a.server.local_addr().unwrap();
    assert_eq!(b.server.peers(), vec![a_addr]);
    assert_eq!(b_seen_by_a.ip(), a_addr.ip());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stopped_peer_is_evicted() {
    let (a, b) = connected_pair().await.unwrap();

    b.shutdown().await.unwrap();
    wait_until("a evicts b", || a.peer_count() == 0).await.unwrap();

    // With nobody left, a miss fails fast.
    assert!(a.server.get("anything").await.is_err());
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_bootstrap_is_skipped() {
    let gone = Node::start(&[]).await.unwrap();
    let gone_addr = gone.addr();
    gone.shutdown().await.unwrap();

    let mut transport = TcpTransportOpts::new("127.0.0.1:0");
    transport.handshake = Arc::new(NopHandshake);
    let server = Arc::new(FileServer::new(FileServerOpts {
        enc_key: network_key(),
        store: StoreOpts {
            root: temp_root(),
            ..StoreOpts::default()
        },
        transport,
        bootstrap_nodes: vec![String::new(), gone_addr],
    }));
    let task = tokio::spawn({
        let server = server.clone();
        async move { server.start().await }
    });
    let node = Node { server, task };
    wait_until("listening", || node.server.local_addr().is_some())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node.peer_count(), 0);
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_version_handshake_pair_replicates() {
    let a = Node::start_with(network_key(), Arc::new(VersionHandshake), &[])
        .await
        .unwrap();
    let b = Node::start_with(network_key(), Arc::new(VersionHandshake), &[&a])
        .await
        .unwrap();
    wait_until("pair connected", || a.peer_count() == 1 && b.peer_count() == 1)
        .await
        .unwrap();

    a.server.store("versioned", &b"hello"[..]).await.unwrap();
    assert_eq!(b.wait_for_local("versioned", 5).await.unwrap(), b"hello");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_version_mismatch_is_never_registered() {
    let a = Node::start_with(network_key(), Arc::new(VersionHandshake), &[])
        .await
        .unwrap();

    let mut stranger = TcpStream::connect(a.addr()).await.unwrap();
    let mut hello = HANDSHAKE_MAGIC.to_vec();
    hello.push(PROTOCOL_VERSION.wrapping_add(1));
    stranger.write_all(&hello).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.peer_count(), 0);

    a.shutdown().await.unwrap();
}
