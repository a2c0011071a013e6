//! Cryptographic helpers for Quarry.
//!
//! Provides three things:
//!   1. The stream cipher adapter: AES-256-CTR over an async copy, with a
//!      fresh random IV per call written as a plaintext preamble
//!   2. BLAKE3 key hashing: the network-wide name of a stored object
//!   3. Random keys and identifiers
//!
//! The cipher is unauthenticated. A wrong key or a tampered stream decrypts
//! to garbage, never to an error. Key material derives ZeroizeOnDrop.

use std::fmt;

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::wire::IV_LEN;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const KEY_LEN: usize = 32;
const COPY_BUF_LEN: usize = 32 * 1024;

// ── Key ───────────────────────────────────────────────────────────────────────

/// Symmetric key for every wire-leg transform.
///
/// Nodes that replicate to each other must hold the same key. The node
/// never writes it to disk; supply it through config to share it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex key.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(CryptoError::BadKeyHex)?;
        let key: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::BadKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

// ── Hashing and ids ───────────────────────────────────────────────────────────

/// Network-wide name of an object: hex BLAKE3 digest of the caller's key.
///
/// Every node stores and requests objects under this name, so the key in a
/// `StoreFile` or `GetFile` message is always the receiver's store key too.
pub fn hash_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// Random 32-byte identifier, hex encoded. Used to give each local
/// instance its own storage subdirectory.
pub fn generate_id() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Generate a random IV for one stream leg.
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

// ── Stream cipher adapter ─────────────────────────────────────────────────────

/// Encrypt everything `src` yields into `dst`.
///
/// Writes the IV first, then the ciphertext. Returns the number of bytes
/// written to `dst`, which is always the input length plus `IV_LEN`.
pub async fn copy_encrypt<R, W>(
    key: &EncryptionKey,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let iv = generate_iv();
    let mut cipher = Aes256Ctr::new(&key.0.into(), &iv.into());

    dst.write_all(&iv).await?;
    let n = copy_stream(&mut cipher, src, dst).await?;
    Ok(IV_LEN as u64 + n)
}

/// Decrypt a stream produced by [`copy_encrypt`] into `dst`.
///
/// Reads the IV preamble, then applies the keystream to the rest. Returns
/// the number of plaintext bytes written to `dst`.
pub async fn copy_decrypt<R, W>(
    key: &EncryptionKey,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_LEN];
    src.read_exact(&mut iv).await.map_err(CryptoError::ShortIv)?;
    let mut cipher = Aes256Ctr::new(&key.0.into(), &iv.into());

    Ok(copy_stream(&mut cipher, src, dst).await?)
}

async fn copy_stream<R, W>(
    cipher: &mut Aes256Ctr,
    src: &mut R,
    dst: &mut W,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    dst.flush().await?;
    Ok(total)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("stream ended before the 16-byte IV: {0}")]
    ShortIv(std::io::Error),
    #[error("stream copy failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid key hex: {0}")]
    BadKeyHex(hex::FromHexError),
    #[error("key must be 32 bytes, got {0}")]
    BadKeyLength(usize),
}
