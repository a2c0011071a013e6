use quarry_core::crypto::hash_key;
use quarry_core::EncryptionKey;
use quarry_net::NopHandshake;
use quarry_server::ServerError;

use crate::*;

#[tokio::test]
async fn test_store_replicates_to_peer() {
    let (a, b) = connected_pair().await.unwrap();
    let data = b"my big data file here!";

    let n = a.server.store("file1", &data[..]).await.unwrap();
    assert_eq!(n, data.len() as u64);

    // b keeps it in cleartext under the hashed key.
    assert_eq!(b.wait_for_local("file1", data.len()).await.unwrap(), data);
    assert!(b.server.local_store().has(&hash_key("file1")).await);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_local_miss_is_fetched_from_peer() {
    let (a, b) = connected_pair().await.unwrap();
    let data = b"fetch me back";

    a.server.store("file2", &data[..]).await.unwrap();
    b.wait_for_local("file2", data.len()).await.unwrap();

    a.server.delete_local("file2").await.unwrap();
    assert!(!a.server.has("file2").await);

    assert_eq!(a.get("file2").await.unwrap(), data);
    assert!(a.server.has("file2").await);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_replication_reaches_every_peer() {
    let hub = Node::start(&[]).await.unwrap();
    let x = Node::start(&[&hub]).await.unwrap();
    let y = Node::start(&[&hub]).await.unwrap();
    wait_until("hub sees both", || hub.peer_count() == 2).await.unwrap();

    let data = vec![0xC3u8; 200 * 1024];
    hub.server.store("large", &data[..]).await.unwrap();

    assert_eq!(x.wait_for_local("large", data.len()).await.unwrap(), data);
    assert_eq!(y.wait_for_local("large", data.len()).await.unwrap(), data);

    hub.shutdown().await.unwrap();
    x.shutdown().await.unwrap();
    y.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_back_to_back_stores_stay_framed() {
    let (a, b) = connected_pair().await.unwrap();

    for i in 0..5u8 {
        let data = vec![i; 1000 + i as usize];
        a.server.store(&format!("obj{i}"), &data[..]).await.unwrap();
    }
    for i in 0..5u8 {
        let data = vec![i; 1000 + i as usize];
        let got = b.wait_for_local(&format!("obj{i}"), data.len()).await.unwrap();
        assert_eq!(got, data);
    }

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_replication_runs_both_ways() {
    let (a, b) = connected_pair().await.unwrap();

    b.server.store("from-b", &b"upstream"[..]).await.unwrap();
    assert_eq!(a.wait_for_local("from-b", 8).await.unwrap(), b"upstream");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mismatched_keys_do_not_decrypt() {
    let a = Node::start_with(EncryptionKey::generate(), Arc::new(NopHandshake), &[])
        .await
        .unwrap();
    let b = Node::start_with(EncryptionKey::generate(), Arc::new(NopHandshake), &[&a])
        .await
        .unwrap();
    wait_until("pair connected", || a.peer_count() == 1 && b.peer_count() == 1)
        .await
        .unwrap();

    let data = b"plaintext payload";
    a.server.store("secret", &data[..]).await.unwrap();

    let garbled = b.wait_for_local("secret", data.len()).await.unwrap();
    assert_ne!(garbled, data);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_get_unknown_key_without_peers() {
    let a = Node::start(&[]).await.unwrap();
    let err = a.server.get("nowhere").await.unwrap_err();
    assert!(matches!(err, ServerError::NotFound(_)));
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_get_leaves_peers_usable() {
    let holder = Node::start(&[]).await.unwrap();
    let data = vec![0x6Du8; 4 * 1024 * 1024];
    holder.server.store("big", &data[..]).await.unwrap();

    let empty = Node::start(&[]).await.unwrap();
    let a = Node::start(&[&holder, &empty]).await.unwrap();
    wait_until("a sees both", || a.peer_count() == 2).await.unwrap();

    // Whichever peer is read first, give up on the fetch. A half-written
    // copy must not survive it.
    for _ in 0..3 {
        if tokio::time::timeout(Duration::from_millis(300), a.server.get("big"))
            .await
            .is_err()
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if a.server.has("big").await {
                assert_eq!(a.get("big").await.unwrap(), data);
            }
        }
        let _ = a.server.delete_local("big").await;
    }

    holder.server.store("after", &b"tiny"[..]).await.unwrap();
    assert_eq!(a.wait_for_local("after", 4).await.unwrap(), b"tiny");
    assert_eq!(a.peer_count(), 2);

    a.shutdown().await.unwrap();
    holder.shutdown().await.unwrap();
    empty.shutdown().await.unwrap();
}
