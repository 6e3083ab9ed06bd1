use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::mqtt::config::Broker;

const APP_DIR: &str = "blynk-bridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings loaded once at startup and never changed afterwards
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub blynk: BlynkConfig,
    pub data_filter: DataFilter,
    pub pin_config: PinConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Delivery endpoint and device identity on the dashboard service
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BlynkConfig {
    pub address: String,
    pub client_id: String,
    pub device_name: String,
    pub template_name: String,
    pub template_id: String,
    pub auth_token: String,
    pub topic: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct DataFilter {
    pub controllers: BTreeSet<i64>,
    pub zones: BTreeSet<i64>,
}

impl DataFilter {
    pub fn allows(&self, controller: i64, zone: i64) -> bool {
        self.controllers.contains(&controller) && self.zones.contains(&zone)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct PinConfig {
    pub base_offset: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            client_id: "blynk-bridge-ingest".to_string(),
            keep_alive_secs: 120,
        }
    }
}

/// Tuning for mapping, batching and supervision
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Rows kept per display table, capped at the size of the source map
    pub row_limit: usize,
    /// Valid rows per published batch
    pub batch_row_limit: usize,
    pub batch_delay_ms: u64,
    pub reconnect_delay_secs: u64,
    pub tick_interval_ms: u64,
    pub publish_timeout_secs: u64,
    pub delivery_keep_alive_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            row_limit: 16,
            batch_row_limit: 8,
            batch_delay_ms: 250,
            reconnect_delay_secs: 5,
            tick_interval_ms: 1000,
            publish_timeout_secs: 10,
            delivery_keep_alive_secs: 45,
        }
    }
}

impl BridgeConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

impl Config {
    pub fn delivery_broker(&self) -> Result<Broker, ConfigError> {
        Broker::parse(&self.blynk.address).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "blynk.address '{}' is not a valid broker address",
                self.blynk.address
            ))
        })
    }

    /// Rejects values the bridge cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("blynk.address", &self.blynk.address),
            ("blynk.client_id", &self.blynk.client_id),
            ("blynk.device_name", &self.blynk.device_name),
            ("blynk.auth_token", &self.blynk.auth_token),
            ("blynk.topic", &self.blynk.topic),
            ("ingest.client_id", &self.ingest.client_id),
        ];
        if let Some((name, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("{} must not be empty", name)));
        }

        self.delivery_broker()?;

        let limits = [
            ("bridge.row_limit", self.bridge.row_limit as u64),
            ("bridge.batch_row_limit", self.bridge.batch_row_limit as u64),
            ("bridge.tick_interval_ms", self.bridge.tick_interval_ms),
            ("bridge.publish_timeout_secs", self.bridge.publish_timeout_secs),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
        }

        if self.data_filter.controllers.is_empty() || self.data_filter.zones.is_empty() {
            info!("Data filter is empty, no rows will be published");
        }
        Ok(())
    }
}

/// Loads and validates the config file. Files ending in `.json` are parsed as JSON, everything else as TOML.
pub async fn load_config(path: &Path) -> Result<Config, ConfigError> {
    debug!("Loading config from {}", path.display());
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let config: Config = if is_json {
        serde_json::from_str(&content)?
    } else {
        toml::from_str(&content)?
    };

    config.validate()?;
    info!(
        "Loaded config for device '{}' ({} controllers, {} zones)",
        config.blynk.device_name,
        config.data_filter.controllers.len(),
        config.data_filter.zones.len()
    );
    Ok(config)
}

/// `<config dir>/blynk-bridge/config.toml`, falling back to the working directory
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        blynk: BlynkConfig {
            address: "blynk.cloud:1883".to_string(),
            client_id: "Log Blynk".to_string(),
            device_name: "device".to_string(),
            template_name: "MWP Log".to_string(),
            template_id: "TMPL0000".to_string(),
            auth_token: "token".to_string(),
            topic: "batch_ds".to_string(),
        },
        data_filter: DataFilter {
            controllers: [1].into_iter().collect(),
            zones: [3].into_iter().collect(),
        },
        pin_config: PinConfig { base_offset: 0 },
        ingest: IngestConfig::default(),
        bridge: BridgeConfig::default(),
    }
}
