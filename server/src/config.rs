//! Configuration for the batchline server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config as ConfigLoader, Environment, File};
use serde::Deserialize;

use batchline_common::ProtocolTag;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client-facing WebSocket endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Protocol advertised to clients in status replies.
    #[serde(default)]
    pub protocol: ProtocolTag,
    #[serde(default = "default_hello_timeout")]
    pub hello_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            protocol: ProtocolTag::Obj,
            hello_timeout_secs: default_hello_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// Each worker gets `tmp_folder/worker-<id>`.
    #[serde(default = "default_tmp_folder")]
    pub tmp_folder: PathBuf,
    #[serde(default = "default_num_worker")]
    pub num_worker: usize,
    /// Maximum number of items in one `predict` call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a partial group may wait for more partitions.
    #[serde(default = "default_batch_group_timeout")]
    pub batch_group_timeout_ms: u64,
    /// Device of baseline worker `i` is `device_map[i % len]`; `-1` is CPU.
    #[serde(default = "default_device_map")]
    pub device_map: Vec<i32>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_max_pending_partitions")]
    pub max_pending_partitions: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            model_name: default_model_name(),
            tmp_folder: default_tmp_folder(),
            num_worker: default_num_worker(),
            batch_size: default_batch_size(),
            batch_group_timeout_ms: default_batch_group_timeout(),
            device_map: default_device_map(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            max_pending_partitions: default_max_pending_partitions(),
        }
    }
}

impl WorkersConfig {
    pub fn batch_group_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_group_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Age after which a pending aggregate is completed with what arrived.
    #[serde(default = "default_aggregation_timeout")]
    pub aggregation_timeout_ms: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            aggregation_timeout_ms: default_aggregation_timeout(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScalingConfig {
    /// Maximum number of extra workers; `0` disables autoscaling.
    #[serde(default)]
    pub num_worker_expanded: usize,
    #[serde(default = "default_device_to_expand")]
    pub device_to_expand: Vec<i32>,
    #[serde(default = "default_busy_util_threshold")]
    pub busy_util_threshold: f64,
    #[serde(default = "default_duration_expand")]
    pub duration_expand_ms: u64,
    #[serde(default = "default_duration_squeeze")]
    pub duration_squeeze_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            num_worker_expanded: 0,
            device_to_expand: default_device_to_expand(),
            busy_util_threshold: default_busy_util_threshold(),
            duration_expand_ms: default_duration_expand(),
            duration_squeeze_ms: default_duration_squeeze(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// HTTP gateway. Disabled unless `port` is set.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_max_connect")]
    pub max_connect: usize,
    #[serde(default = "default_retry_num")]
    pub concurrent_retry_num: u32,
    #[serde(default = "default_retry_gap")]
    pub concurrent_retry_gap_secs: f64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    /// Allowed CORS origins (comma-separated, `*` for any).
    #[serde(default = "default_cors_origins")]
    pub cors_origins: String,
    /// Timeout of the gateway's own client calls.
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: None,
            max_connect: default_max_connect(),
            concurrent_retry_num: default_retry_num(),
            concurrent_retry_gap_secs: default_retry_gap(),
            max_upload_bytes: default_max_upload_bytes(),
            cors_origins: default_cors_origins(),
            client_timeout_secs: default_client_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5555
}
fn default_hello_timeout() -> u64 {
    10
}
fn default_model_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_model_name() -> String {
    "echo".to_string()
}
fn default_tmp_folder() -> PathBuf {
    std::env::temp_dir().join("batchline")
}
fn default_num_worker() -> usize {
    1
}
fn default_batch_size() -> usize {
    10
}
fn default_batch_group_timeout() -> u64 {
    5
}
fn default_device_map() -> Vec<i32> {
    vec![-1]
}
fn default_heartbeat_interval() -> u64 {
    1_000
}
fn default_heartbeat_timeout() -> u64 {
    10_000
}
fn default_max_pending_partitions() -> usize {
    10_000
}
fn default_aggregation_timeout() -> u64 {
    15 * 60 * 1_000
}
fn default_sweep_interval() -> u64 {
    1_000
}
fn default_device_to_expand() -> Vec<i32> {
    vec![0]
}
fn default_busy_util_threshold() -> f64 {
    0.95
}
fn default_duration_expand() -> u64 {
    300_000
}
fn default_duration_squeeze() -> u64 {
    600_000
}
fn default_poll_interval() -> u64 {
    1_000
}
fn default_max_connect() -> usize {
    100
}
fn default_retry_num() -> u32 {
    100
}
fn default_retry_gap() -> f64 {
    0.05
}
fn default_max_upload_bytes() -> u64 {
    5_242_880
}
fn default_cors_origins() -> String {
    "*".to_string()
}
fn default_client_timeout() -> u64 {
    15 * 60
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (BATCHLINE__SECTION__KEY format)
    /// 2. batchline.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new("batchline"), false)
    }

    /// Like [`Config::load`] with an explicit file, which must exist when
    /// `required` is set.
    pub fn load_from(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let loader = ConfigLoader::builder()
            .add_source(File::from(path).required(required))
            .add_source(
                Environment::with_prefix("BATCHLINE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("workers.device_map")
                    .with_list_parse_key("scaling.device_to_expand"),
            )
            .build()?;

        let config: Config = loader.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.workers.batch_size < 1 {
            return invalid("workers.batch_size must be at least 1");
        }
        if self.workers.num_worker < 1 {
            return invalid("workers.num_worker must be at least 1");
        }
        if self.workers.device_map.is_empty() {
            return invalid("workers.device_map must not be empty");
        }
        if self.workers.heartbeat_timeout_ms <= self.workers.heartbeat_interval_ms {
            return invalid("workers.heartbeat_timeout_ms must exceed heartbeat_interval_ms");
        }
        if self.scaling.num_worker_expanded > 0 && self.scaling.device_to_expand.is_empty() {
            return invalid("scaling.device_to_expand must not be empty when expansion is enabled");
        }
        let threshold = self.scaling.busy_util_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return invalid("scaling.busy_util_threshold must be in (0, 1]");
        }
        if self.scaling.poll_interval_ms == 0 {
            return invalid("scaling.poll_interval_ms must be positive");
        }
        if self.aggregation.sweep_interval_ms == 0 {
            return invalid("aggregation.sweep_interval_ms must be positive");
        }
        if self.http.max_connect < 1 {
            return invalid("http.max_connect must be at least 1");
        }
        if self.http.concurrent_retry_gap_secs < 0.0 {
            return invalid("http.concurrent_retry_gap_secs must not be negative");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.workers.batch_size, 10);
        assert_eq!(config.workers.batch_group_timeout_ms, 5);
        assert_eq!(config.workers.device_map, vec![-1]);
        assert_eq!(config.scaling.num_worker_expanded, 0);
        assert_eq!(config.scaling.device_to_expand, vec![0]);
        assert_eq!(config.scaling.busy_util_threshold, 0.95);
        assert_eq!(config.scaling.duration_expand_ms, 300_000);
        assert_eq!(config.scaling.duration_squeeze_ms, 600_000);
        assert_eq!(config.http.max_connect, 100);
        assert_eq!(config.http.concurrent_retry_num, 100);
        assert_eq!(config.http.max_upload_bytes, 5_242_880);
        assert!(config.http.port.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.workers.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.workers.device_map.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scaling.busy_util_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scaling.busy_util_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scaling.num_worker_expanded = 2;
        config.scaling.device_to_expand.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 6000
protocol = "numpy"

[workers]
num_worker = 3
batch_size = 4
device_map = [0, 1]

[scaling]
num_worker_expanded = 2
device_to_expand = [2, 3]
"#
        )
        .unwrap();

        let config = Config::load_from(file.path(), true).unwrap();
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.protocol, ProtocolTag::Numpy);
        assert_eq!(config.workers.num_worker, 3);
        assert_eq!(config.workers.device_map, vec![0, 1]);
        assert_eq!(config.scaling.device_to_expand, vec![2, 3]);
        // Untouched sections keep their defaults.
        assert_eq!(config.http.max_connect, 100);
    }

    #[test]
    fn test_load_rejects_unknown_protocol() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[server]\nprotocol = \"pickle\"").unwrap();
        assert!(matches!(
            Config::load_from(file.path(), true),
            Err(ConfigError::Load(_))
        ));
    }
}
