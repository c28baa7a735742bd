//! Configuration and paths

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which persistence layer backs the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// contacts.json / messages.json / devices.json in the data directory
    Json,
    /// relay.db in the data directory
    Sqlite,
    /// Nothing survives a restart
    Memory,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Json => write!(f, "json"),
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

/// All configurable addresses, paths and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_addr: SocketAddr,
    pub console_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub backend: BackendKind,
    pub message_retention: usize,
    pub idle_timeout_secs: u64,
    pub shutdown_grace_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("relay-host"))
            .unwrap_or_else(|| PathBuf::from("relay-host-data"));

        Self {
            device_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DEVICE_PORT)),
            console_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_CONSOLE_PORT)),
            data_dir,
            backend: BackendKind::Json,
            message_retention: 100,
            idle_timeout_secs: 60,
            shutdown_grace_ms: 2000,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl Config {
    /// Create config for testing with custom paths and ephemeral ports
    pub fn for_test(temp_dir: &Path) -> Self {
        Self {
            device_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            console_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            data_dir: temp_dir.to_path_buf(),
            backend: BackendKind::Json,
            message_retention: 100,
            idle_timeout_secs: 1,
            shutdown_grace_ms: 500,
            max_frame_bytes: 64 * 1024,
        }
    }

    /// Load a JSON config file; missing keys fall back to defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.message_retention == 0 {
            return Err(Error::Config("message_retention must be at least 1".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(Error::Config("max_frame_bytes must be at least 1".into()));
        }
        if self.idle_timeout_secs == 0 {
            return Err(Error::Config("idle_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn contacts_file(&self) -> PathBuf {
        self.data_dir.join("contacts.json")
    }

    /// Append-only message journal
    pub fn messages_file(&self) -> PathBuf {
        self.data_dir.join("messages.jsonl")
    }

    pub fn devices_file(&self) -> PathBuf {
        self.data_dir.join("devices.json")
    }

    pub fn sqlite_file(&self) -> PathBuf {
        self.data_dir.join("relay.db")
    }
}

/// Port for feature-phone / smartphone clients
pub const DEFAULT_DEVICE_PORT: u16 = 9998;

/// Port the monitoring console polls
pub const DEFAULT_CONSOLE_PORT: u16 = 9999;
