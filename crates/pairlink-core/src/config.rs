//! Configuration system for Pairlink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PAIRLINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/pairlink/config.toml
//!   3. ~/.config/pairlink/config.toml

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::HEADER_SIZE;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PairlinkConfig {
    pub signaling: SignalingConfig,
    pub transport: TransportConfig,
    pub chunker: ChunkerConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Room joined by `ConnectionManager::connect_to_room`.
    pub room: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// ICE servers handed to every new peer connection.
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Largest frame written to the binary channel, header included.
    /// Must exceed the 21-byte header.
    pub max_frame_size: usize,
    /// Pending transfers with no new frame for this long are discarded.
    pub transfer_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Buffered bytes above which a send waits for the channel to drain.
    pub low_water_mark: usize,
    /// How long a send waits for drain before failing.
    pub drain_timeout_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            room: "default".to_string(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
        }
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024,
            transfer_timeout_ms: 5_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            low_water_mark: 64 * 1024,
            drain_timeout_ms: 500,
        }
    }
}

impl ChunkerConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// Payload bytes carried by each full data frame.
    pub fn payload_capacity(&self) -> usize {
        self.max_frame_size.saturating_sub(HEADER_SIZE)
    }
}

impl SessionConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("pairlink")
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

impl PairlinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            PairlinkConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a specific file without applying env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PAIRLINK_CONFIG")
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
            let text = toml::to_string_pretty(&PairlinkConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PAIRLINK_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PAIRLINK_SIGNALING__ROOM") {
            self.signaling.room = v;
        }
        if let Ok(v) = std::env::var("PAIRLINK_CHUNKER__MAX_FRAME_SIZE") {
            if let Ok(n) = v.parse() {
                self.chunker.max_frame_size = n;
            }
        }
        if let Ok(v) = std::env::var("PAIRLINK_CHUNKER__TRANSFER_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.chunker.transfer_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("PAIRLINK_SESSION__LOW_WATER_MARK") {
            if let Ok(n) = v.parse() {
                self.session.low_water_mark = n;
            }
        }
        if let Ok(v) = std::env::var("PAIRLINK_SESSION__DRAIN_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.session.drain_timeout_ms = n;
            }
        }
    }
}
