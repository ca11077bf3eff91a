//! Session configuration - stored as config.json in FINGERLOCK_HOME

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Advertised-name substring of the sensor/lock peripheral firmware
pub const DEFAULT_NAME_MARKER: &str = "Project Zero R2";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// A peripheral matches when its advertised name contains this
    pub name_marker: String,
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    /// Write-gate hold time after the lock acknowledges a write
    pub settle_delay_ms: u64,
    /// Classifier model (JSON); without one every classification fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name_marker: DEFAULT_NAME_MARKER.to_string(),
            scan_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            disconnect_timeout_ms: 5_000,
            settle_delay_ms: 3_000,
            model_path: None,
        }
    }
}

impl SessionConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Load `config.json` from `home`, writing the defaults first if it is missing
    pub fn load_or_create(home: &Path) -> Result<Self, ConfigError> {
        let path = home.join("config.json");

        if path.exists() {
            let data = fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&data)?)
        } else {
            let config = Self::default();
            fs::create_dir_all(home)?;
            fs::write(&path, serde_json::to_string_pretty(&config)?)?;
            log::info!("Wrote default config to {}", path.display());
            Ok(config)
        }
    }
}

/// Get FINGERLOCK_HOME (default `~/.fingerlock`), creating it if needed
pub fn fingerlock_home() -> Result<PathBuf, ConfigError> {
    let home = match std::env::var("FINGERLOCK_HOME") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => dirs::home_dir().ok_or(ConfigError::NoHome)?.join(".fingerlock"),
    };

    if !home.exists() {
        fs::create_dir_all(&home)?;
    }

    Ok(home)
}
