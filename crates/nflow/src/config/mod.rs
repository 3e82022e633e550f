//! Runtime Configuration
//!
//! TOML configuration with environment overrides (`NFLOW_*`). Every table is
//! optional; missing options fall back to the defaults below. The
//! `[database_nflow]` SQL templates and `[redis]` settings are parsed and kept
//! available for externally mounted store/sink implementations even though the
//! core never executes them itself.

use std::collections::BTreeMap;
use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database_nflow: DatabaseConfig,
    #[serde(default)]
    pub vm_pool: VmPoolConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub plugin: PluginConfig,
    /// Free-form map exposed to scripts as the `env` global
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Backing-store settings
///
/// The SQL templates are consumed by external `AppStore`/`LogSink`
/// implementations; the bundled file/memory stores ignore them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub dsn: String,
    #[serde(default, alias = "queryGetUser")]
    pub query_get_user: String,
    #[serde(default, alias = "queryGetApp")]
    pub query_get_app: String,
    #[serde(default, alias = "queryGetModule")]
    pub query_get_module: String,
    #[serde(default, alias = "queryInsertLog")]
    pub query_insert_log: String,
}

/// VM pool and per-run resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmPoolConfig {
    /// Maximum live VM count
    #[serde(default = "default_pool_max")]
    pub max_size: usize,
    /// VMs pre-created at startup
    #[serde(default = "default_preload")]
    pub preload_size: usize,
    /// Idle VM eviction horizon, minutes
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Idle-VM sweep period, minutes
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Periodic logging of pool stats
    #[serde(default)]
    pub enable_metrics: bool,
    /// Per-run memory growth allowance, MiB
    #[serde(default = "default_max_memory")]
    pub max_memory_mb: usize,
    /// Per-run wall-clock limit, seconds
    #[serde(default = "default_max_execution")]
    pub max_execution_seconds: u64,
    /// Per-run operation budget, measured in interpreter check quanta
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    /// Watcher ticks between memory samples
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// Widen the sandbox whitelist with filesystem helpers
    #[serde(default)]
    pub enable_filesystem: bool,
    /// Widen the sandbox whitelist with network helpers
    #[serde(default)]
    pub enable_network: bool,
    /// Strip unsafe globals and cap console output
    #[serde(default = "default_true")]
    pub enable_sandbox: bool,
}

impl Default for VmPoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_max(),
            preload_size: default_preload(),
            idle_timeout: default_idle_timeout(),
            cleanup_interval: default_cleanup_interval(),
            enable_metrics: false,
            max_memory_mb: default_max_memory(),
            max_execution_seconds: default_max_execution(),
            max_operations: default_max_operations(),
            check_interval: default_check_interval(),
            enable_filesystem: false,
            enable_network: false,
            enable_sandbox: true,
        }
    }
}

fn default_pool_max() -> usize {
    8
}

fn default_preload() -> usize {
    2
}

fn default_idle_timeout() -> u64 {
    5
}

fn default_cleanup_interval() -> u64 {
    1
}

fn default_max_memory() -> usize {
    128
}

fn default_max_execution() -> u64 {
    30
}

fn default_max_operations() -> u64 {
    10_000_000
}

fn default_check_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// Log tracker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Periodic flush, milliseconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
    /// Stats log period, seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
    #[serde(default)]
    pub verbose_logging: bool,
    /// Optional JSON-lines sink path; empty selects the null sink
    #[serde(default)]
    pub log_path: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: default_workers(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            channel_buffer: default_channel_buffer(),
            stats_interval: default_stats_interval(),
            verbose_logging: false,
            log_path: String::new(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    250
}

fn default_channel_buffer() -> usize {
    100_000
}

fn default_stats_interval() -> u64 {
    60
}

/// Session cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle eviction horizon, minutes
    #[serde(default = "default_session_ttl")]
    pub ttl_minutes: u64,
    /// Sweep period, seconds
    #[serde(default = "default_session_sweep")]
    pub sweep_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: default_session_ttl(),
            sweep_seconds: default_session_sweep(),
        }
    }
}

fn default_session_ttl() -> u64 {
    30
}

fn default_session_sweep() -> u64 {
    60
}

/// Redis helper exposure (client lives outside the core)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, alias = "maxconnectionpool")]
    pub max_connection_pool: u32,
}

/// Plugin registration order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub plugins: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file merged with `NFLOW_*` environment
    /// overrides. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("NFLOW_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.vm_pool.max_size, 8);
        assert_eq!(config.tracker.batch_size, 100);
        assert_eq!(config.tracker.channel_buffer, 100_000);
        assert_eq!(config.tracker.flush_interval, 250);
        assert!(config.tracker.enabled);
        assert!(config.vm_pool.enable_sandbox);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load(Path::new("/nonexistent/nflow.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        write!(
            file,
            r#"
[server]
port = 9000

[vm_pool]
max_size = 2
max_execution_seconds = 1

[tracker]
workers = 1
batch_size = 10

[database_nflow]
queryInsertLog = "INSERT INTO log VALUES (?)"

[env]
stage = "test"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.vm_pool.max_size, 2);
        assert_eq!(config.vm_pool.max_execution_seconds, 1);
        assert_eq!(config.tracker.workers, 1);
        assert_eq!(
            config.database_nflow.query_insert_log,
            "INSERT INTO log VALUES (?)"
        );
        assert_eq!(config.env.get("stage").map(String::as_str), Some("test"));
    }
}
