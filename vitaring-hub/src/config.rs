use crate::error::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_PATH_ENV: &str = "VITARING_CONFIG";
pub const FEED_ROOT_ENV: &str = "VITARING_FEED_ROOT";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HubConfig {
    pub feed: FeedConf,
    pub device: DeviceConf,
    pub synthetic: SyntheticConf,
    pub hub: HubConf,
    pub http: HttpConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FeedConf {
    /// Collection name; device topics live under `<root>/<deviceId>`.
    pub root: String,
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConf {
    pub active: String,
    pub legacy: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyntheticConf {
    pub interval_ms: u64,
    pub baseline: String,
    pub seed: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Autostart {
    Live,
    Synthetic,
    Idle,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HubConf {
    pub restart_grace_ms: u64,
    pub autostart: Autostart,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for FeedConf {
    fn default() -> Self {
        Self {
            root: "realtimeSensorData".into(),
            host: "localhost".into(),
            port: 1883,
            keep_alive_secs: 15,
            client_id: None,
        }
    }
}

impl Default for DeviceConf {
    fn default() -> Self {
        Self {
            active: "ESP32C3-A835B29E9EF0".into(),
            legacy: vec!["ESP32C3-A835629EDEF8".into(), "ESP32C3-A8358206CF8".into()],
        }
    }
}

impl Default for SyntheticConf {
    fn default() -> Self {
        Self { interval_ms: 5000, baseline: "demo".into(), seed: None }
    }
}

impl Default for HubConf {
    fn default() -> Self {
        Self { restart_grace_ms: 1000, autostart: Autostart::Live }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl HubConfig {
    pub fn parse(txt: &str) -> Result<Self> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt).map_err(|e| TelemetryError::Config(e.to_string()))
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.hub.restart_grace_ms)
    }

    pub fn synthetic_interval(&self) -> Duration {
        Duration::from_millis(self.synthetic.interval_ms)
    }

    /// The feed root may be overridden from the environment.
    pub fn apply_env(mut self) -> Self {
        if let Ok(root) = std::env::var(FEED_ROOT_ENV) {
            let root = root.trim().trim_matches('/').to_string();
            if !root.is_empty() {
                self.feed.root = root;
            }
        }
        self
    }
}

pub async fn load_config_from(path: impl AsRef<Path>) -> Result<HubConfig> {
    let path = path.as_ref();
    let txt = fs::read_to_string(path)
        .await
        .map_err(|e| TelemetryError::Config(format!("{}: {e}", path.display())))?;
    HubConfig::parse(&txt)
}

/// Reads `VITARING_CONFIG` (default `vitaring.yaml`); a missing or invalid file falls back to defaults.
pub async fn load_config() -> HubConfig {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "vitaring.yaml".into());
    let cfg = if Path::new(&path).exists() {
        match load_config_from(&path).await {
            Ok(cfg) => {
                info!("loaded config from {path}");
                cfg
            }
            Err(e) => {
                warn!("invalid config, using defaults: {e}");
                HubConfig::default()
            }
        }
    } else {
        warn!("no {path}, using default config");
        HubConfig::default()
    };
    cfg.apply_env()
}
