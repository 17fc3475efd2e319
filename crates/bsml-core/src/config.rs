//! Configuration system for the BSML streaming daemon.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BSML_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/bsml/config.toml
//!   3. ~/.config/bsml/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::ChecksumMode;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BsmlConfig {
    pub network: NetworkConfig,
    pub streaming: StreamingConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address both listeners bind to.
    pub bind: String,
    /// TCP port for block-protocol socket sessions. 0 = OS-assigned.
    pub socket_port: u16,
    /// HTTP port for the ReST surface.
    pub http_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Hard cap on samples per SIGNAL_DATA block.
    pub max_points: usize,
    /// Integrity policy applied to blocks received from clients.
    pub request_checksum: ChecksumMode,
    /// Integrity policy applied to blocks we send.
    pub response_checksum: ChecksumMode,
    /// Close a socket connection once its request has been served.
    pub close_after_request: bool,
    /// Close a socket connection on a framing or checksum error.
    pub close_on_framing_error: bool,
    /// Transport chunk size for raw passthrough downloads and uploads.
    pub http_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding uploaded recording files.
    pub recordings_path: PathBuf,
    /// Prefix joined with request paths to form recording URIs.
    pub base_uri: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            socket_port: 8090,
            http_port: 8080,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_points: 4096,
            request_checksum: ChecksumMode::Check,
            response_checksum: ChecksumMode::Strict,
            close_after_request: true,
            close_on_framing_error: true,
            http_chunk_size: 32 * 1024,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            recordings_path: data_dir().join("recordings"),
            base_uri: "http://localhost:8080/".to_string(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("bsml")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("bsml")
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BsmlConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&path, &text)?
        } else {
            BsmlConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_toml(path: &std::path::Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BSML_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BsmlConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply BSML_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = lookup("BSML_NETWORK__BIND") {
            self.network.bind = v;
        }
        if let Some(p) = lookup("BSML_NETWORK__SOCKET_PORT").and_then(|v| v.parse().ok()) {
            self.network.socket_port = p;
        }
        if let Some(p) = lookup("BSML_NETWORK__HTTP_PORT").and_then(|v| v.parse().ok()) {
            self.network.http_port = p;
        }
        if let Some(n) = lookup("BSML_STREAMING__MAX_POINTS").and_then(|v| v.parse().ok()) {
            self.streaming.max_points = n;
        }
        if let Some(m) = lookup("BSML_STREAMING__REQUEST_CHECKSUM").and_then(|v| v.parse().ok()) {
            self.streaming.request_checksum = m;
        }
        if let Some(m) = lookup("BSML_STREAMING__RESPONSE_CHECKSUM").and_then(|v| v.parse().ok()) {
            self.streaming.response_checksum = m;
        }
        if let Some(v) = lookup("BSML_STREAMING__CLOSE_AFTER_REQUEST") {
            self.streaming.close_after_request = flag(v);
        }
        if let Some(v) = lookup("BSML_STREAMING__CLOSE_ON_FRAMING_ERROR") {
            self.streaming.close_on_framing_error = flag(v);
        }
        if let Some(n) = lookup("BSML_STREAMING__HTTP_CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.streaming.http_chunk_size = n;
        }
        if let Some(v) = lookup("BSML_STORAGE__RECORDINGS_PATH") {
            self.storage.recordings_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("BSML_STORAGE__BASE_URI") {
            self.storage.base_uri = v;
        }
    }
}
