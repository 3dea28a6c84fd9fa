//! # Configuration Management
//!
//! This module handles loading and parsing configuration from the
//! svp-config.toml file. It provides a centralized way to configure the atlas
//! sources, the client list, server timing and persistence.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "svp-config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("config serialization failed: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Application configuration loaded from svp-config.toml
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Atlas sources and grid download settings
    pub atlas: AtlasConfig,
    /// Echo sounder clients and transmission policy
    pub clients: ClientsConfig,
    /// Synthetic profile server loop
    pub server: ServerConfig,
    /// Telemetry listener ports
    pub listeners: ListenersConfig,
    /// Profile persistence
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Directory for downloaded grid documents
    pub cache_dir: PathBuf,
    /// Age after which a cached grid is downloaded again
    pub cache_ttl_minutes: u64,
    pub http_timeout_secs: u64,
    pub climatology: ClimatologyConfig,
    pub global_forecast: ForecastConfig,
    pub regional: Vec<RegionalConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClimatologyConfig {
    pub enabled: bool,
    /// Monthly document, expanded with `{month}`
    pub url_template: String,
    /// Seasonal document extending the monthly levels to depth, expanded
    /// with `{season}`
    pub seasonal_url_template: Option<String>,
    pub search_radius: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub enabled: bool,
    pub model: String,
    /// Daily document, expanded with `{model}` and `{date}`
    pub url_template: String,
    pub search_radius: usize,
}

/// A regional forecast model; same engine as the global forecast.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegionalConfig {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub model: String,
    pub url_template: String,
    #[serde(default = "default_forecast_radius")]
    pub search_radius: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientsConfig {
    /// `name:ip:port:protocol[:echo_port]`
    pub targets: Vec<String>,
    /// Confirmation wait budget in seconds
    pub confirm_wait_secs: u64,
    pub poll_interval_ms: u64,
    /// Thinning tolerances (m/s), tried in order until the sentence fits
    pub tolerances: Vec<f64>,
    /// Largest accepted speed difference between sent and echoed profile
    pub speed_tolerance: f64,
    pub max_payload: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name of the atlas source the server queries
    pub source: String,
    pub poll_secs: u64,
    pub recovery_secs: u64,
    /// Navigation fixes older than this are treated as missing
    pub stale_after_secs: u64,
    /// Splice live surface sound speed into each profile
    pub surface_correction: bool,
    /// Surface speed change (m/s) that forces a refresh in an unchanged cell
    pub speed_delta_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenersConfig {
    /// Port receiving position and surface sound speed datagrams
    pub navigation_port: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub directory: PathBuf,
}

fn enabled_by_default() -> bool {
    true
}

fn default_forecast_radius() -> usize {
    5
}

impl Default for AtlasConfig {
    fn default() -> Self {
        AtlasConfig {
            cache_dir: std::env::temp_dir().join("svp-grid-cache"),
            cache_ttl_minutes: 360,
            http_timeout_secs: 60,
            climatology: ClimatologyConfig::default(),
            global_forecast: ForecastConfig::default(),
            regional: Vec::new(),
        }
    }
}

impl Default for ClimatologyConfig {
    fn default() -> Self {
        ClimatologyConfig {
            enabled: true,
            url_template: "atlas/woa_t{month}.json.gz".to_string(),
            seasonal_url_template: Some("atlas/woa_t{season}.json.gz".to_string()),
            search_radius: 2,
        }
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        ForecastConfig {
            enabled: false,
            model: "rtofs".to_string(),
            url_template: "forecast/{model}_{date}.json.gz".to_string(),
            search_radius: default_forecast_radius(),
        }
    }
}

impl Default for ClientsConfig {
    fn default() -> Self {
        ClientsConfig {
            targets: vec!["SIS:127.0.0.1:4001:SIS:16103".to_string()],
            confirm_wait_secs: 30,
            poll_interval_ms: 1000,
            tolerances: vec![0.01, 0.03, 0.06, 0.1, 0.5],
            speed_tolerance: 0.2,
            max_payload: crate::protocol::MAX_DATAGRAM_PAYLOAD,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            source: "climatology".to_string(),
            poll_secs: 3,
            recovery_secs: 1,
            stale_after_secs: 10,
            surface_correction: true,
            speed_delta_threshold: 1.0,
        }
    }
}

impl Default for ListenersConfig {
    fn default() -> Self {
        ListenersConfig {
            navigation_port: 16100,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            directory: PathBuf::from("profiles"),
        }
    }
}

impl Config {
    /// Load configuration from svp-config.toml
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_FILE)
    }

    /// Load configuration from specified path
    /// Falls back to default configuration if file doesn't exist or is invalid
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        clients = config.clients.targets.len(),
                        source = %config.server.source,
                        "loaded configuration"
                    );
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Write the configuration as pretty TOML.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), contents)?;
        info!(path = %path.as_ref().display(), "configuration saved");
        Ok(())
    }
}
