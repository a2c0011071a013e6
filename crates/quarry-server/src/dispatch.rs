//! Handles control messages pulled off the transport's inbound channel.

use std::net::SocketAddr;

use quarry_core::crypto;
use quarry_core::wire::IV_LEN;
use quarry_core::{Envelope, Message};

use crate::error::ServerError;
use crate::server::FileServer;

/// Keys on the wire are always `hash_key` output: 64 lowercase hex chars.
fn is_object_key(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl FileServer {
    pub(crate) async fn handle_message(&self, envelope: Envelope) -> Result<(), ServerError> {
        let Envelope { from, message } = envelope;
        match message {
            Message::StoreFile {
                key,
                size,
                stream_id,
            } => self.handle_store_file(from, key, size, stream_id).await,
            Message::GetFile { key, request_id } => {
                self.handle_get_file(from, key, request_id).await
            }
        }
    }

    /// A peer is pushing an object: take its stream and keep a cleartext copy.
    async fn handle_store_file(
        &self,
        from: SocketAddr,
        key: String,
        size: u64,
        stream_id: u64,
    ) -> Result<(), ServerError> {
        let peer = self
            .registry
            .get(&from)
            .ok_or(ServerError::UnknownPeer(from))?;
        let incoming = peer.claim_stream(stream_id);
        if !is_object_key(&key) {
            // Dropping the claim lets the connection drain the body.
            return Err(ServerError::BadKey(key));
        }

        let n = match self.store.write_decrypt(&self.enc_key, &key, incoming).await {
            Ok(n) => n,
            Err(e) => {
                self.store.discard(&key).await?;
                return Err(e.into());
            }
        };
        let got = n + IV_LEN as u64;
        if got != size {
            self.store.discard(&key).await?;
            return Err(ServerError::SizeMismatch {
                key,
                expected: size,
                got,
            });
        }

        tracing::info!(peer = %from, key = %key, bytes = n, "stored replica");
        Ok(())
    }

    /// A peer wants an object. Answer with a stream if we hold it; stay
    /// silent otherwise.
    async fn handle_get_file(
        &self,
        from: SocketAddr,
        key: String,
        request_id: u64,
    ) -> Result<(), ServerError> {
        if !is_object_key(&key) {
            return Err(ServerError::BadKey(key));
        }
        if !self.store.has(&key).await {
            return Err(ServerError::NotFound(key));
        }
        let peer = self
            .registry
            .get(&from)
            .ok_or(ServerError::UnknownPeer(from))?;

        let (size, mut file) = self.store.read(&key).await?;
        let mut writer = peer.writer().await;
        writer
            .stream_header(request_id, size + IV_LEN as u64)
            .await?;
        let sent = crypto::copy_encrypt(&self.enc_key, &mut file, &mut writer).await?;

        tracing::info!(peer = %from, key = %key, bytes = sent, "served file");
        Ok(())
    }
}
