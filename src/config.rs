use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::mqtt::config::{BackoffConfig, HeartbeatConfig, ManagerSettings, MqttConfig};
use crate::naming::DeviceNaming;
use crate::tls::{TlsError, TlsMaterial};

const CONFIG_DIR: &str = ".config/forklift-link";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Could not parse config file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Could not write config file {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("Could not serialize config: {0}")]
    Serialize(String),
}

/// Paths of the PEM files handed to the TLS bootstrap.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct TlsPaths {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl TlsPaths {
    /// `None` unless all three paths are set.
    pub async fn load(&self) -> Option<Result<TlsMaterial, TlsError>> {
        match (&self.ca, &self.cert, &self.key) {
            (Some(ca), Some(cert), Some(key)) => Some(TlsMaterial::read_files(ca, cert, key).await),
            (None, None, None) => None,
            _ => {
                warn!("Incomplete [tls] section, all of ca, cert and key are needed");
                None
            }
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub broker: MqttConfig,
    pub naming: DeviceNaming,
    pub heartbeat: HeartbeatConfig,
    pub backoff: BackoffConfig,
    pub tls: TlsPaths,
}

impl AppConfig {
    /// `~/.config/forklift-link/config.toml`
    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        if !exists {
            warn!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigError::Write {
                    path: parent.display().to_string(),
                    reason: e.to_string(),
                })?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ConfigError::Write {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        info!("Config written to {}", path.display());
        Ok(())
    }

    /// Writes the defaults unless a file already exists. Returns whether it wrote.
    pub async fn ensure_default(path: &Path) -> Result<bool, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        if exists {
            return Ok(false);
        }
        Self::default().save(path).await?;
        Ok(true)
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            mqtt: self.broker.clone(),
            heartbeat: self.heartbeat.clone(),
            backoff: self.backoff.clone(),
        }
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
