//! Configuration system for Quarry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $QUARRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/quarry/config.toml
//!   3. ~/.config/quarry/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::crypto::{CryptoError, EncryptionKey};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP address to listen on. Port 0 = OS-assigned.
    pub listen_addr: String,
    /// Peers dialed once at startup. Empty entries are ignored.
    pub bootstrap_nodes: Vec<String>,
    /// Handshake run on every new connection.
    pub handshake: HandshakeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store root.
    pub root: PathBuf,
    /// Nest the store under a freshly generated id, so several nodes can
    /// run from one root.
    pub instance_dir: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Hex-encoded 32-byte key shared by every node of the network.
    /// Unset = generate a fresh key on each start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeKind {
    /// Accept every connection.
    #[default]
    Nop,
    /// Exchange magic + protocol version, drop on mismatch.
    Version,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            bootstrap_nodes: Vec::new(),
            handshake: HandshakeKind::Nop,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("store"),
            instance_dir: false,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("quarry")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("quarry")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid encryption key: {0}")]
    InvalidKey(CryptoError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load a specific file, falling back to defaults if it does not exist.
    /// No env overrides are applied.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(NodeConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("QUARRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    /// Write default config to `path` unless something is already there.
    pub fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text =
            toml::to_string_pretty(&NodeConfig::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply QUARRY_* overrides, looking each name up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("QUARRY_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = lookup("QUARRY_NETWORK__BOOTSTRAP_NODES") {
            self.network.bootstrap_nodes = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("QUARRY_NETWORK__HANDSHAKE") {
            match v.as_str() {
                "nop" => self.network.handshake = HandshakeKind::Nop,
                "version" => self.network.handshake = HandshakeKind::Version,
                other => tracing::warn!(value = other, "unknown handshake kind, ignoring"),
            }
        }
        if let Some(v) = lookup("QUARRY_STORAGE__ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("QUARRY_STORAGE__INSTANCE_DIR") {
            self.storage.instance_dir = v == "true" || v == "1";
        }
        if let Some(v) = lookup("QUARRY_SECURITY__ENCRYPTION_KEY") {
            self.security.encryption_key = Some(v);
        }
    }

    /// The configured network key, or a fresh one if none is set.
    pub fn encryption_key(&self) -> Result<EncryptionKey, ConfigError> {
        match &self.security.encryption_key {
            Some(hex) => EncryptionKey::from_hex(hex).map_err(ConfigError::InvalidKey),
            None => Ok(EncryptionKey::generate()),
        }
    }
}
