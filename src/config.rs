use serde::Deserialize;
use std::path::Path;

/// Environment variable consulted when the config file carries no key.
const API_KEY_ENV: &str = "TRANSIT_API_KEY";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Upstream API key. The feeds reject unauthenticated requests, so a
    /// missing key means the workers skip their runs (the read API still
    /// serves whatever the store holds).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Address the read API binds to
    #[serde(default = "Config::default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub realtime_sync: RealtimeSyncConfig,
    #[serde(default)]
    pub schedule_sync: ScheduleSyncConfig,
}

/// The four remote endpoints. All are authenticated with the same key,
/// passed as a query parameter (legacy constraint of the upstream).
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "UpstreamConfig::default_schedule_url")]
    pub schedule_url: String,
    #[serde(default = "UpstreamConfig::default_trip_updates_url")]
    pub trip_updates_url: String,
    #[serde(default = "UpstreamConfig::default_vehicle_positions_url")]
    pub vehicle_positions_url: String,
    #[serde(default = "UpstreamConfig::default_alerts_url")]
    pub alerts_url: String,
}

/// Configuration for the periodic realtime aggregation run
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeSyncConfig {
    /// Interval in seconds between realtime runs (default: 120)
    #[serde(default = "RealtimeSyncConfig::default_interval_secs")]
    pub interval_secs: u64,
    /// TTL on the published status; chosen so one missed run is survivable
    /// and two make the value expire (default: 180)
    #[serde(default = "RealtimeSyncConfig::default_ttl_secs")]
    pub ttl_secs: u64,
    /// Shared timeout budget across the three parallel feed fetches
    /// (default: 10)
    #[serde(default = "RealtimeSyncConfig::default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

/// Configuration for the daily schedule rebuild
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSyncConfig {
    /// Interval in seconds between schedule runs (default: 86400)
    #[serde(default = "ScheduleSyncConfig::default_interval_secs")]
    pub interval_secs: u64,
    /// Lower bound (YYYYMMDD) the built calendar must extend to. When
    /// unset, the worker uses the current date — a feed whose calendar
    /// already ended never publishes.
    #[serde(default)]
    pub min_calendar_end_date: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            bind_addr: Self::default_bind_addr(),
            upstream: UpstreamConfig::default(),
            realtime_sync: RealtimeSyncConfig::default(),
            schedule_sync: ScheduleSyncConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            schedule_url: Self::default_schedule_url(),
            trip_updates_url: Self::default_trip_updates_url(),
            vehicle_positions_url: Self::default_vehicle_positions_url(),
            alerts_url: Self::default_alerts_url(),
        }
    }
}

impl UpstreamConfig {
    fn default_schedule_url() -> String {
        "https://api.511.org/transit/datafeeds?operator_id=CT".to_string()
    }
    fn default_trip_updates_url() -> String {
        "https://api.511.org/transit/tripupdates?agency=CT".to_string()
    }
    fn default_vehicle_positions_url() -> String {
        "https://api.511.org/transit/vehiclepositions?agency=CT".to_string()
    }
    fn default_alerts_url() -> String {
        "https://api.511.org/transit/servicealerts?agency=CT".to_string()
    }
}

impl Default for RealtimeSyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: Self::default_interval_secs(),
            ttl_secs: Self::default_ttl_secs(),
            fetch_timeout_secs: Self::default_fetch_timeout_secs(),
        }
    }
}

impl RealtimeSyncConfig {
    fn default_interval_secs() -> u64 {
        120
    }
    fn default_ttl_secs() -> u64 {
        180
    }
    fn default_fetch_timeout_secs() -> u64 {
        10
    }
}

impl Default for ScheduleSyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: Self::default_interval_secs(),
            min_calendar_end_date: None,
        }
    }
}

impl ScheduleSyncConfig {
    fn default_interval_secs() -> u64 {
        86_400
    }
}

impl Config {
    fn default_bind_addr() -> String {
        "0.0.0.0:3000".to_string()
    }

    /// Load configuration from a YAML file. A missing file yields the
    /// defaults so the server can still start and serve stored data.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => serde_yaml::from_str::<Config>(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(ConfigError::ReadError(e.to_string())),
        };
        if config.api_key.is_none() {
            config.api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        }
        Ok(config)
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
