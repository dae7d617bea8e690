use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::extract::TripThresholds;
use crate::orchestrator::SyncConfig;
use crate::ratelimit::RateLimitConfig;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub thresholds: TripThresholds,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address for the HTTP server to listen on
    pub http_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpstreamConfig {
    /// Synthetic provider for local runs and tests.
    Mock,
    Http {
        /// Base URL of the telematics provider API
        base_url: String,
        /// API access token
        token: String,
        /// Timezone offset the provider expects on trip-report queries
        #[serde(default)]
        utc_offset_minutes: i32,
    },
}

#[derive(Debug, Deserialize)]
pub struct SchedulerConfig {
    /// Whether the periodic sync loop runs at all
    pub enabled: bool,
    /// Interval in seconds between scheduled incremental syncs
    pub interval_secs: u64,
    /// Devices to sync on schedule; empty means all known devices
    #[serde(default)]
    pub device_ids: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 900,
            device_ids: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                http_addr: "0.0.0.0:8090".parse().unwrap(),
            },
            storage: StorageConfig::Memory,
            upstream: UpstreamConfig::Mock,
            scheduler: SchedulerConfig::default(),
            sync: SyncConfig::default(),
            thresholds: TripThresholds::default(),
            ratelimit: RateLimitConfig::default(),
        }
    }
}
