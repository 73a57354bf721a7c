use crate::errors::{DaemonError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "PRINTFLEET_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub version: String,
    pub polling: PollingConfig,
    pub camera: CameraConfig,
    pub connection: ConnectionConfig,
    pub log: LogConfig,
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollingConfig {
    pub active_interval_ms: u64,
    pub inactive_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CameraConfig {
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub bind_address: String,
    pub ffmpeg_path: String,
    pub default_frame_rate: u8,
    pub default_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    pub auto_connect: bool,
    pub legacy_port: u16,
    pub modern_port: u16,
    pub discovery_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    /// text or json
    pub format: String,
    pub file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            polling: PollingConfig::default(),
            camera: CameraConfig::default(),
            connection: ConnectionConfig::default(),
            log: LogConfig::default(),
            store_path: None,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            active_interval_ms: 3_000,
            inactive_interval_ms: 10_000,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            port_range_start: 8181,
            port_range_end: 8191,
            bind_address: "127.0.0.1".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            default_frame_rate: 30,
            default_quality: 3,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            command_timeout_ms: 10_000,
            discovery_timeout_ms: 3_000,
            auto_connect: true,
            legacy_port: 8899,
            modern_port: 8898,
            discovery_port: 48899,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

impl PollingConfig {
    pub fn active_interval(&self) -> Duration {
        Duration::from_millis(self.active_interval_ms)
    }

    pub fn inactive_interval(&self) -> Duration {
        Duration::from_millis(self.inactive_interval_ms)
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

impl AppConfig {
    /// Load from `PRINTFLEET_CONFIG` or the platform config dir, falling back
    /// to defaults when no file exists.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_config_path);
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&raw).map_err(|e| {
            DaemonError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        info!("Config loaded from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let camera = &self.camera;
        if camera.port_range_start == 0 || camera.port_range_start > camera.port_range_end {
            return Err(DaemonError::Config(format!(
                "Invalid camera port range {}-{}",
                camera.port_range_start, camera.port_range_end
            )));
        }
        if !(1..=60).contains(&camera.default_frame_rate) {
            return Err(DaemonError::Config(format!(
                "Default frame rate {} outside 1-60",
                camera.default_frame_rate
            )));
        }
        if !(1..=5).contains(&camera.default_quality) {
            return Err(DaemonError::Config(format!(
                "Default quality {} outside 1-5",
                camera.default_quality
            )));
        }

        let polling = &self.polling;
        if polling.active_interval_ms == 0 || polling.inactive_interval_ms == 0 {
            return Err(DaemonError::Config("Polling intervals must be non-zero".to_string()));
        }
        if polling.active_interval_ms > polling.inactive_interval_ms {
            warn!(
                "Active polling interval ({}ms) is slower than inactive ({}ms)",
                polling.active_interval_ms, polling.inactive_interval_ms
            );
            return Err(DaemonError::Config(
                "Active polling interval must not exceed the inactive interval".to_string(),
            ));
        }
        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("printfleet"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn default_config_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Location of the persisted printer details.
    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("printers.json"))
    }
}
