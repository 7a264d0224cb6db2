//! Daemon Configuration
//!
//! Configuration management for the pairing daemon.

use anyhow::{Context, Result};
use gcs_pairing_protocol::manager::DEFAULT_LOCAL_NAME;
use gcs_pairing_protocol::pairing::DEFAULT_PAIR_PATH;
use gcs_pairing_protocol::recovery::{DEFAULT_RECONNECT_INTERVAL, DEFAULT_RECONNECT_JITTER};
use gcs_pairing_protocol::transport::{DEFAULT_BASE_PORT, DEFAULT_IDLE_TIMEOUT};
use gcs_pairing_protocol::upload::{DEFAULT_RETRY_DELAY, DEFAULT_UPLOAD_ATTEMPTS, DEFAULT_UPLOAD_TIMEOUT};
use gcs_pairing_protocol::{ManagerConfig, ReconnectPolicy, RetryPolicy, UdpLinkConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name inside the config directory
pub const CONFIG_FILE: &str = "daemon.toml";

const APP_DIR: &str = "gcs-pairing";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local device configuration
    #[serde(default)]
    pub device: DeviceConfig,

    /// Handshake configuration
    #[serde(default)]
    pub pairing: PairingConfig,

    /// Reconnect supervisor configuration
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Link transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Storage paths
    #[serde(default)]
    pub paths: PathConfig,
}

/// Local device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name announced to field devices
    #[serde(default = "default_device_name")]
    pub name: String,
}

/// Handshake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Seconds to wait for an offer after pairing starts
    #[serde(default = "default_pairing_timeout")]
    pub timeout_secs: u64,

    /// Seconds a failure status stays visible
    #[serde(default = "default_status_hold")]
    pub status_hold_secs: u64,

    /// Path of the pair endpoint when an offer carries no URL
    #[serde(default = "default_pair_path")]
    pub pair_path: String,

    /// Per-request upload timeout in seconds
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,

    /// Total upload attempts
    #[serde(default = "default_upload_attempts")]
    pub upload_attempts: u32,

    /// Milliseconds between upload attempts
    #[serde(default = "default_upload_retry_delay")]
    pub upload_retry_delay_ms: u64,
}

/// Reconnect supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Base seconds between reconnect sweeps
    #[serde(default = "default_reconnect_interval")]
    pub interval_secs: u64,

    /// Maximum random milliseconds added to each interval
    #[serde(default = "default_reconnect_jitter")]
    pub jitter_ms: u64,
}

/// Link transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Address link sockets bind to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port of channel 0; a device listens on `base_port + channel`
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Seconds without traffic before a link counts as inactive
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Directory holding the config file and the identity key
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Directory holding one file per paired device
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_device_name() -> String {
    DEFAULT_LOCAL_NAME.to_string()
}

fn default_pairing_timeout() -> u64 {
    120
}

fn default_status_hold() -> u64 {
    10
}

fn default_pair_path() -> String {
    DEFAULT_PAIR_PATH.to_string()
}

fn default_upload_timeout() -> u64 {
    DEFAULT_UPLOAD_TIMEOUT.as_secs()
}

fn default_upload_attempts() -> u32 {
    DEFAULT_UPLOAD_ATTEMPTS
}

fn default_upload_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY.as_millis() as u64
}

fn default_reconnect_interval() -> u64 {
    DEFAULT_RECONNECT_INTERVAL.as_secs()
}

fn default_reconnect_jitter() -> u64 {
    DEFAULT_RECONNECT_JITTER.as_millis() as u64
}

fn default_bind_addr() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_secs()
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join(APP_DIR)
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join(APP_DIR)
        .join("devices")
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_pairing_timeout(),
            status_hold_secs: default_status_hold(),
            pair_path: default_pair_path(),
            upload_timeout_secs: default_upload_timeout(),
            upload_attempts: default_upload_attempts(),
            upload_retry_delay_ms: default_upload_retry_delay(),
        }
    }
}

impl PairingConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconnect_interval(),
            jitter_ms: default_reconnect_jitter(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            base_port: default_base_port(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl TransportConfig {
    /// Settings for the UDP link transport
    pub fn link_config(&self) -> UdpLinkConfig {
        UdpLinkConfig {
            bind_addr: self.bind_addr,
            base_port: self.base_port,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            pairing: PairingConfig::default(),
            reconnect: ReconnectConfig::default(),
            transport: TransportConfig::default(),
            paths: PathConfig::default(),
        }
    }
}

impl Config {
    /// Path of the default config file
    pub fn default_path() -> PathBuf {
        default_config_dir().join(CONFIG_FILE)
    }

    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    /// Load configuration from `path`, writing defaults there if not found
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir).context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.cache_dir).context("Failed to create pairing cache directory")?;
        Ok(())
    }

    /// Settings for the pairing manager
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            local_name: self.device.name.clone(),
            pairing_timeout: Duration::from_secs(self.pairing.timeout_secs),
            status_hold: Duration::from_secs(self.pairing.status_hold_secs),
            upload_retry: RetryPolicy {
                attempts: self.pairing.upload_attempts,
                delay: Duration::from_millis(self.pairing.upload_retry_delay_ms),
                attempt_timeout: self.pairing.upload_timeout(),
            },
            reconnect: ReconnectPolicy {
                interval: Duration::from_secs(self.reconnect.interval_secs),
                jitter: Duration::from_millis(self.reconnect.jitter_ms),
            },
            pair_path: self.pairing.pair_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pairing.timeout_secs, 120);
        assert_eq!(config.pairing.upload_attempts, 3);
        assert_eq!(config.transport.base_port, DEFAULT_BASE_PORT);
        assert!(config.paths.cache_dir.ends_with("devices"));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.device.name, config.device.name);
        assert_eq!(parsed.transport.bind_addr, config.transport.bind_addr);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [device]
            name = "Field Station 2"

            [reconnect]
            interval_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(parsed.device.name, "Field Station 2");
        assert_eq!(parsed.reconnect.interval_secs, 30);
        assert_eq!(parsed.reconnect.jitter_ms, 2000);
        assert_eq!(parsed.pairing.pair_path, "/pair");
    }

    #[test]
    fn test_load_creates_default_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(CONFIG_FILE);

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.device.name, config.device.name);
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&path, "[pairing\ntimeout_secs = ").unwrap();

        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_manager_config_conversion() {
        let mut config = Config::default();
        config.pairing.upload_attempts = 5;
        config.pairing.upload_timeout_secs = 2;
        config.reconnect.jitter_ms = 0;

        let manager = config.manager_config();
        assert_eq!(manager.upload_retry.attempts, 5);
        assert_eq!(manager.upload_retry.attempt_timeout, Duration::from_secs(2));
        assert_eq!(manager.reconnect.jitter, Duration::ZERO);
        assert_eq!(manager.local_name, config.device.name);

        let link = config.transport.link_config();
        assert_eq!(link.idle_timeout, Duration::from_secs(5));
    }
}
