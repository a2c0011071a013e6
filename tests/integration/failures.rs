use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use quarry_core::crypto::{self, hash_key};
use quarry_core::wire::{IV_LEN, TAG_CONTROL, TAG_STREAM};
use quarry_core::{Codec, JsonCodec, Message};

use crate::*;

// ── Raw peer ──────────────────────────────────────────────────────────────────

/// A connection driven by hand, frame by frame.
struct RawPeer(TcpStream);

impl RawPeer {
    /// Connect to `node`, which has no other peers, and wait until it
    /// registers us.
    async fn connect(node: &Node) -> Result<RawPeer> {
        let stream = TcpStream::connect(node.addr()).await?;
        wait_until("raw peer registered", || node.peer_count() == 1).await?;
        Ok(RawPeer(stream))
    }

    async fn control(&mut self, msg: &Message) -> Result<()> {
        let mut frame = vec![TAG_CONTROL];
        frame.extend(JsonCodec.encode(msg)?);
        self.0.write_all(&frame).await?;
        Ok(())
    }

    async fn stream(&mut self, stream_id: u64, body: &[u8]) -> Result<()> {
        let mut frame = vec![TAG_STREAM];
        frame.extend_from_slice(&stream_id.to_le_bytes());
        frame.extend_from_slice(&(body.len() as u64).to_le_bytes());
        frame.extend_from_slice(body);
        self.0.write_all(&frame).await?;
        Ok(())
    }

    /// Push `data` under `name` the way a real node replicates it.
    async fn push(&mut self, name: &str, data: &[u8], stream_id: u64) -> Result<()> {
        let body = seal(data).await?;
        self.control(&Message::StoreFile {
            key: hash_key(name),
            size: body.len() as u64,
            stream_id,
        })
        .await?;
        self.stream(stream_id, &body).await
    }
}

async fn seal(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    crypto::copy_encrypt(&network_key(), &mut &data[..], &mut out).await?;
    Ok(out)
}

// ── Dispatch failures ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_size_mismatch_discards_object() {
    let node = Node::start(&[]).await.unwrap();
    let mut raw = RawPeer::connect(&node).await.unwrap();

    let body = seal(b"announced one byte too long").await.unwrap();
    raw.control(&Message::StoreFile {
        key: hash_key("sized"),
        size: body.len() as u64 + 1,
        stream_id: 1,
    })
    .await
    .unwrap();
    raw.stream(1, &body).await.unwrap();

    // Messages are handled in order, so once this lands the first is done.
    raw.push("marker", b"marker", 2).await.unwrap();
    assert_eq!(node.wait_for_local("marker", 6).await.unwrap(), b"marker");

    assert!(!node.server.has("sized").await);
    assert_eq!(node.peer_count(), 1);
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bad_key_body_is_drained() {
    let node = Node::start(&[]).await.unwrap();
    let mut raw = RawPeer::connect(&node).await.unwrap();

    let body = vec![0x41u8; 2 * 1024 * 1024];
    raw.control(&Message::StoreFile {
        key: "../../outside".into(),
        size: body.len() as u64,
        stream_id: 3,
    })
    .await
    .unwrap();
    raw.stream(3, &body).await.unwrap();

    raw.push("after-bad-key", b"still here", 4).await.unwrap();
    assert_eq!(
        node.wait_for_local("after-bad-key", 10).await.unwrap(),
        b"still here"
    );
    assert_eq!(node.peer_count(), 1);
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_get_for_absent_key_sends_nothing() {
    let node = Node::start(&[]).await.unwrap();
    let mut raw = RawPeer::connect(&node).await.unwrap();

    raw.control(&Message::GetFile {
        key: hash_key("missing"),
        request_id: 9,
    })
    .await
    .unwrap();

    let mut byte = [0u8; 1];
    let silent = tokio::time::timeout(Duration::from_millis(300), raw.0.read(&mut byte)).await;
    assert!(silent.is_err(), "node answered a request for a missing key");

    // The same connection still gets answers for objects the node holds.
    let data = b"held right here";
    node.server
        .local_store()
        .write(&hash_key("present"), &data[..])
        .await
        .unwrap();
    raw.control(&Message::GetFile {
        key: hash_key("present"),
        request_id: 10,
    })
    .await
    .unwrap();

    let mut head = [0u8; 17];
    raw.0.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], TAG_STREAM);
    let stream_id = u64::from_le_bytes(head[1..9].try_into().unwrap());
    let length = u64::from_le_bytes(head[9..17].try_into().unwrap());
    assert_eq!(stream_id, 10);
    assert_eq!(length, (data.len() + IV_LEN) as u64);

    let mut body = vec![0u8; length as usize];
    raw.0.read_exact(&mut body).await.unwrap();
    let mut plain = Vec::new();
    crypto::copy_decrypt(&network_key(), &mut &body[..], &mut plain)
        .await
        .unwrap();
    assert_eq!(plain, data);

    node.shutdown().await.unwrap();
}
