//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::services::EnrichmentKind;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub ksqldb: KsqlDbConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// WebSocket gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Prefix of the WebSocket routes
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Outbound frames buffered per connection before it is evicted
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle time after which a per-device session sends a ping
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,

    /// A client that does not accept a frame within this time is disconnected
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_directory_heartbeat")]
    pub directory_heartbeat_secs: u64,

    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_base_path() -> String {
    "/ws".to_string()
}

fn default_mailbox_capacity() -> usize {
    256
}

fn default_max_connections() -> usize {
    10_000
}

fn default_heartbeat_interval() -> u64 {
    1000 // 1 second
}

fn default_receive_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    5000
}

fn default_directory_heartbeat() -> u64 {
    30
}

fn default_stats_interval() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: default_base_path(),
            mailbox_capacity: default_mailbox_capacity(),
            max_connections: default_max_connections(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            receive_timeout_secs: default_receive_timeout(),
            write_timeout_ms: default_write_timeout(),
            directory_heartbeat_secs: default_directory_heartbeat(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl GatewayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn directory_heartbeat(&self) -> Duration {
        Duration::from_secs(self.directory_heartbeat_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

/// Event-stream platform configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Consumer group ids are `<group_prefix>_<device id>`
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,

    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    /// How long an unsubscribe waits for its worker thread
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,

    #[serde(default = "default_handoff_capacity")]
    pub handoff_capacity: usize,

    #[serde(default = "default_pump_interval")]
    pub pump_interval_ms: u64,
}

fn default_brokers() -> String {
    "broker:29092".to_string()
}

fn default_group_prefix() -> String {
    "api_device_stream_group".to_string()
}

fn default_poll_timeout() -> u64 {
    500
}

fn default_join_timeout() -> u64 {
    5000
}

fn default_handoff_capacity() -> usize {
    10_000
}

fn default_pump_interval() -> u64 {
    10
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group_prefix: default_group_prefix(),
            poll_timeout_ms: default_poll_timeout(),
            join_timeout_ms: default_join_timeout(),
            handoff_capacity: default_handoff_capacity(),
            pump_interval_ms: default_pump_interval(),
        }
    }
}

/// ksqlDB configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KsqlDbConfig {
    #[serde(default = "default_ksqldb_url")]
    pub url: String,

    #[serde(default = "default_ksqldb_timeout")]
    pub request_timeout_ms: u64,

    /// Zone used to render record timestamps in derived streams
    #[serde(default = "default_timestamp_zone")]
    pub timestamp_zone: String,

    #[serde(default = "default_source_stream")]
    pub source_stream: String,

    #[serde(default = "default_command_stream")]
    pub command_stream: String,

    /// Asset the command channel addresses
    #[serde(default = "default_command_asset")]
    pub command_asset: String,

    #[serde(default)]
    pub stats: StatsTableConfig,

    /// Device id -> sidecar lookup applied to its updates
    #[serde(default = "default_enrichment")]
    pub enrichment: HashMap<String, EnrichmentKind>,
}

fn default_ksqldb_url() -> String {
    "http://ksqldb-server:8088".to_string()
}

fn default_ksqldb_timeout() -> u64 {
    5000
}

fn default_timestamp_zone() -> String {
    "America/Los_Angeles".to_string()
}

fn default_source_stream() -> String {
    "ASSETS_STREAM".to_string()
}

fn default_command_stream() -> String {
    "CMDS_STREAM".to_string()
}

fn default_command_asset() -> String {
    "IVAC".to_string()
}

fn default_enrichment() -> HashMap<String, EnrichmentKind> {
    HashMap::from([
        ("IVAC".to_string(), EnrichmentKind::Durations),
        ("DUSTTRAK".to_string(), EnrichmentKind::MovingAverage),
    ])
}

impl Default for KsqlDbConfig {
    fn default() -> Self {
        Self {
            url: default_ksqldb_url(),
            request_timeout_ms: default_ksqldb_timeout(),
            timestamp_zone: default_timestamp_zone(),
            source_stream: default_source_stream(),
            command_stream: default_command_stream(),
            command_asset: default_command_asset(),
            stats: StatsTableConfig::default(),
            enrichment: default_enrichment(),
        }
    }
}

impl KsqlDbConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Table holding accumulated state durations
#[derive(Debug, Clone, Deserialize)]
pub struct StatsTableConfig {
    #[serde(default = "default_stats_table")]
    pub table: String,

    #[serde(default = "default_stats_key_column")]
    pub key_column: String,

    #[serde(default = "default_stats_value_column")]
    pub value_column: String,

    /// Characters stripped from the front of a key to leave the state name
    #[serde(default = "default_stats_key_offset")]
    pub key_offset: usize,
}

fn default_stats_table() -> String {
    "IVAC_POWER_STATE_TOTALS".to_string()
}

fn default_stats_key_column() -> String {
    "IVAC_POWER_KEY".to_string()
}

fn default_stats_value_column() -> String {
    "TOTAL_DURATION_SEC".to_string()
}

fn default_stats_key_offset() -> usize {
    11
}

impl Default for StatsTableConfig {
    fn default() -> Self {
        Self {
            table: default_stats_table(),
            key_column: default_stats_key_column(),
            value_column: default_stats_value_column(),
            key_offset: default_stats_key_offset(),
        }
    }
}

/// When the monitor client gives up on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Stop after `max_attempts` consecutive failures
    Bounded,
    /// Retry until shut down
    Unbounded,
}

impl std::str::FromStr for RetryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bounded" => Ok(RetryPolicy::Bounded),
            "unbounded" => Ok(RetryPolicy::Unbounded),
            other => Err(format!("unknown retry policy: {}", other)),
        }
    }
}

/// Monitor client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Gateway WebSocket base URL
    #[serde(default = "default_monitor_url")]
    pub url: String,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retry_policy")]
    pub policy: RetryPolicy,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,
}

fn default_monitor_url() -> String {
    "ws://ofa-api:8000/ws".to_string()
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_retry_policy() -> RetryPolicy {
    RetryPolicy::Bounded
}

fn default_max_attempts() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_sink_capacity() -> usize {
    1024
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            url: default_monitor_url(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            policy: default_retry_policy(),
            max_attempts: default_max_attempts(),
            connect_timeout_ms: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            sink_capacity: default_sink_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("devgate").join("config.toml")),
            Some(PathBuf::from("/etc/devgate/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Gateway overrides
        if let Some(host) = lookup("DEVGATE_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = lookup("DEVGATE_PORT") {
            match port.parse() {
                Ok(p) => self.gateway.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid DEVGATE_PORT"),
            }
        }

        // Backends
        if let Some(brokers) = lookup("DEVGATE_KAFKA_BROKERS") {
            self.stream.brokers = brokers;
        }
        if let Some(url) = lookup("DEVGATE_KSQLDB_URL") {
            self.ksqldb.url = url;
        }
        if let Some(url) = lookup("DEVGATE_MONITOR_URL") {
            self.monitor.url = url;
        }

        // Logging overrides
        if let Some(level) = lookup("DEVGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("DEVGATE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# devgate Configuration
#
# Environment variables override these settings:
# - DEVGATE_HOST
# - DEVGATE_PORT
# - DEVGATE_KAFKA_BROKERS
# - DEVGATE_KSQLDB_URL
# - DEVGATE_MONITOR_URL
# - DEVGATE_LOG_LEVEL
# - DEVGATE_LOG_FORMAT

[gateway]
# Listen address
host = "0.0.0.0"
port = 8000

# Prefix of the WebSocket routes (<base_path>/devices, <base_path>/devices/{id})
base_path = "/ws"

# Frames buffered per connection; a connection whose mailbox is full is evicted
mailbox_capacity = 256

# Maximum number of concurrent connections
max_connections = 10000

# Idle time before a per-device session sends a ping (ms)
heartbeat_interval_ms = 1000

# Receive timeout of a per-device session (seconds)
receive_timeout_secs = 30

# Time allowed for a client to accept one frame before it is disconnected (ms)
write_timeout_ms = 5000

# Ping interval of directory connections (seconds)
directory_heartbeat_secs = 30

# How often connection statistics are logged (seconds)
stats_interval_secs = 30

[stream]
# Kafka bootstrap servers
brokers = "broker:29092"

# Consumer groups are <group_prefix>_<device id>
group_prefix = "api_device_stream_group"

# Blocking poll timeout of topic workers (ms)
poll_timeout_ms = 500

# How long unsubscribe waits for a worker to stop (ms)
join_timeout_ms = 5000

# Records buffered between topic workers and the pump; oldest dropped first
handoff_capacity = 10000

# Pump drain interval (ms)
pump_interval_ms = 10

[ksqldb]
url = "http://ksqldb-server:8088"
request_timeout_ms = 5000
timestamp_zone = "America/Los_Angeles"
source_stream = "ASSETS_STREAM"
command_stream = "CMDS_STREAM"
command_asset = "IVAC"

[ksqldb.stats]
table = "IVAC_POWER_STATE_TOTALS"
key_column = "IVAC_POWER_KEY"
value_column = "TOTAL_DURATION_SEC"
key_offset = 11

# Sidecar lookup per device: durations or moving_average
[ksqldb.enrichment]
IVAC = "durations"
DUSTTRAK = "moving_average"

[monitor]
# Gateway WebSocket base URL
url = "ws://ofa-api:8000/ws"

# Reconnect backoff: min(base * 2^(attempt - 1), max)
base_delay_ms = 1000
max_delay_ms = 30000

# bounded: give up after max_attempts consecutive failures; unbounded: never
policy = "bounded"
max_attempts = 5

connect_timeout_ms = 10000
idle_timeout_secs = 60

# Frames buffered between device loops and local consumers
sink_capacity = 1024

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
