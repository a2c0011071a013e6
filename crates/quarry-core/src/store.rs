//! Content-addressable file store.
//!
//! Objects are located by a deterministic transform of their key. With the
//! default CAS transform the layout is:
//!   {root}/[{instance_id}/]{h[0..5]}/{h[5..10]}/.../{h[35..40]}/{h}
//! where h is the hex SHA-1 of the key. Eight levels of five hex characters
//! bound the fan-out of every directory.
//!
//! Bytes on disk are always the cleartext payload.
//!
//! Writes are NOT atomic: a crash mid-write leaves a short file that looks
//! like a valid one. `delete` is coarse: it removes the first directory
//! segment, taking every key that shares it.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::crypto::{self, CryptoError, EncryptionKey};

/// Root folder used when none is configured.
pub const DEFAULT_ROOT: &str = "quarrynetwork";

/// Width of each directory segment produced by the CAS transform.
const BLOCK_SIZE: usize = 5;

// ── Path transform ────────────────────────────────────────────────────────────

/// Where a key lives, relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Directory path, segments joined by `/`.
    pub path_name: String,
    pub file_name: String,
}

impl PathKey {
    /// First segment of the directory path: the bucket `delete` removes.
    pub fn first_path_name(&self) -> &str {
        self.path_name.split('/').next().unwrap_or_default()
    }

    pub fn full_path(&self) -> String {
        format!("{}/{}", self.path_name, self.file_name)
    }
}

/// Pure mapping from key to location. Must return the same `PathKey` for
/// the same key, always.
pub type PathTransform = fn(&str) -> PathKey;

/// SHA-1 the key, hex encode it, and split the 40 characters into eight
/// 5-character directory segments. The file name is the full digest.
pub fn cas_path_transform(key: &str) -> PathKey {
    let hash = hex::encode(Sha1::digest(key.as_bytes()));

    let segments: Vec<&str> = (0..hash.len() / BLOCK_SIZE)
        .map(|i| &hash[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE])
        .collect();

    PathKey {
        path_name: segments.join("/"),
        file_name: hash,
    }
}

/// Identity transform: the key is both the directory and the file name.
/// Only safe for keys that are already filesystem-friendly.
pub fn identity_path_transform(key: &str) -> PathKey {
    PathKey {
        path_name: key.to_string(),
        file_name: key.to_string(),
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreOpts {
    /// Folder holding every object. Empty = `DEFAULT_ROOT`.
    pub root: PathBuf,
    pub path_transform: PathTransform,
    /// Nest the whole layout under `root/instance_id`, so several nodes can
    /// share one root on a single machine.
    pub instance_id: Option<String>,
}

impl Default for StoreOpts {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            path_transform: cas_path_transform,
            instance_id: None,
        }
    }
}

/// Content-addressable store on the local filesystem.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    path_transform: PathTransform,
}

impl Store {
    pub fn new(opts: StoreOpts) -> Self {
        let mut root = if opts.root.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_ROOT)
        } else {
            opts.root
        };
        if let Some(id) = opts.instance_id.filter(|id| !id.is_empty()) {
            root = root.join(id);
        }
        Self {
            root,
            path_transform: opts.path_transform,
        }
    }

    /// Effective root, including the instance subdirectory if any.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_key(&self, key: &str) -> PathKey {
        (self.path_transform)(key)
    }

    fn full_path(&self, key: &str) -> PathBuf {
        let path_key = self.path_key(key);
        self.root.join(&path_key.path_name).join(&path_key.file_name)
    }

    /// Check if an object exists.
    pub async fn has(&self, key: &str) -> bool {
        fs::metadata(self.full_path(key)).await.is_ok()
    }

    /// Write everything `reader` yields under `key`, replacing any previous
    /// object. Returns the number of bytes written.
    pub async fn write<R>(&self, key: &str, mut reader: R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let (path, mut file) = self.create(key).await?;
        let n = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| StoreError::Write(path.clone(), e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::Write(path.clone(), e))?;

        tracing::debug!(path = %path.display(), bytes = n, "object written");
        Ok(n)
    }

    /// Decrypt a stream leg from `reader` and write the cleartext under
    /// `key`. Returns the number of cleartext bytes written.
    pub async fn write_decrypt<R>(
        &self,
        enc_key: &EncryptionKey,
        key: &str,
        mut reader: R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let (path, mut file) = self.create(key).await?;
        let n = crypto::copy_decrypt(enc_key, &mut reader, &mut file).await?;

        tracing::debug!(path = %path.display(), bytes = n, "object written (decrypted)");
        Ok(n)
    }

    /// Open an object for reading. Returns its size and a handle positioned
    /// at offset 0; the caller owns the handle.
    pub async fn read(&self, key: &str) -> Result<(u64, File), StoreError> {
        let path = self.full_path(key);
        let file = File::open(&path)
            .await
            .map_err(|e| StoreError::Read(path.clone(), e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| StoreError::Read(path.clone(), e))?
            .len();
        Ok((size, file))
    }

    /// Remove the whole first-level bucket `key` falls into. Other keys in
    /// the same bucket go with it.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path_key = self.path_key(key);
        let bucket = self.root.join(path_key.first_path_name());
        remove_dir_if_exists(&bucket).await?;

        tracing::debug!(file = %path_key.file_name, bucket = %bucket.display(), "deleted from disk");
        Ok(())
    }

    /// Remove the object file for `key` only, leaving its directories.
    /// Missing objects are not an error.
    pub async fn discard(&self, key: &str) -> Result<(), StoreError> {
        let path = self.full_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Remove(path, e)),
        }
    }

    /// Remove the store root and everything under it.
    pub async fn clear(&self) -> Result<(), StoreError> {
        remove_dir_if_exists(&self.root).await
    }

    async fn create(&self, key: &str) -> Result<(PathBuf, File), StoreError> {
        let path_key = self.path_key(key);
        let dir = self.root.join(&path_key.path_name);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Create(dir.clone(), e))?;

        let path = dir.join(&path_key.file_name);
        let file = File::create(&path)
            .await
            .map_err(|e| StoreError::Create(path.clone(), e))?;
        Ok((path, file))
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Remove(path.to_path_buf(), e)),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create {0}: {1}")]
    Create(PathBuf, std::io::Error),
    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to remove {0}: {1}")]
    Remove(PathBuf, std::io::Error),
    #[error("decrypting write failed: {0}")]
    Crypto(#[from] CryptoError),
}

impl StoreError {
    /// True when the object simply is not there.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Read(_, e) if e.kind() == ErrorKind::NotFound)
    }
}
