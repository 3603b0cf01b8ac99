//! TOML configuration for the iKVM client.
//!
//! Default location:
//! - Linux:    `$XDG_CONFIG_HOME/ikvm/config.toml` (or `~/.config/ikvm/`)
//! - Windows:  `%APPDATA%\iKVM\config.toml`
//! - macOS:    `~/Library/Application Support/iKVM/config.toml`
//!
//! ```toml
//! [server]
//! host = "192.168.1.50"
//! port = 7130
//!
//! [mjpg_streamer]
//! port = 8080
//! capture_device = "USB Video"
//! capture_scale = "16:9"
//! capture_quality = "best"
//!
//! [serial_device]
//! port = "/dev/ttyUSB0"
//! usbid = "1a86:7523"
//!
//! [log]
//! level = "info"
//! ```
//!
//! Every field is optional.  Values with a fixed syntax (`usbid`,
//! `capture_scale`, `capture_quality`) are validated while parsing, so a typo
//! is reported against the file rather than at connect time.

use std::path::{Path, PathBuf};

use ikvm_core::protocol::messages::{DEFAULT_MJPG_PORT, DEFAULT_SERVER_PORT};
use ikvm_core::{AspectRatio, Quality, UsbId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::infrastructure::network::KvmConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub mjpg_streamer: MjpgStreamerConfig,
    pub serial_device: SerialDeviceConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MjpgStreamerConfig {
    pub port: u16,
    /// Substring of the capture device name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_scale: Option<AspectRatio>,
    pub capture_quality: Quality,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialDeviceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usbid: Option<UsbId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_SERVER_PORT,
        }
    }
}

impl Default for MjpgStreamerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_MJPG_PORT,
            capture_device: None,
            capture_scale: None,
            capture_quality: Quality::Best,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Builds the connection settings for `host`.
    pub fn to_kvm_config(&self, host: &str) -> KvmConfig {
        let mut kvm = KvmConfig::new(host);
        kvm.port = self.server.port;
        kvm.mjpg_port = self.mjpg_streamer.port;
        kvm.capture_name = self.mjpg_streamer.capture_device.clone();
        kvm.capture_scale = self.mjpg_streamer.capture_scale;
        kvm.quality = self.mjpg_streamer.capture_quality;
        kvm.serial_port = self.serial_device.port.clone();
        kvm.usb_id = self.serial_device.usbid;
        kvm
    }

    /// Copies the devices a session settled on back into the file settings.
    pub fn remember(&mut self, kvm: &KvmConfig) {
        self.server.host = Some(kvm.host.clone());
        self.server.port = kvm.port;
        if kvm.serial_port.is_some() {
            self.serial_device.port = kvm.serial_port.clone();
        }
        if kvm.capture_name.is_some() {
            self.mjpg_streamer.capture_device = kvm.capture_name.clone();
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined from the environment.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config at `path`, or the defaults when the file does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] for malformed TOML or invalid values.
pub fn load_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no config file, using defaults");
            Ok(ClientConfig::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating the directory if needed.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system failures, [`ConfigError::Serialize`]
/// if serialization fails.
pub fn save_config(path: &Path, config: &ClientConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("iKVM"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("iKVM"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("ikvm"))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
