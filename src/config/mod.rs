//! Application configuration.
//!
//! Aggregates every configuration item enumerated in the specification's
//! external-interfaces section into a single `Config` struct, loadable from
//! a YAML file or environment variables the same way for every binary.

use std::time::Duration;

use serde::Deserialize;

/// Environment variable for the configuration file path.
pub const CONFIG_ENV_VAR: &str = "SAGA_CONFIG";
/// Prefix for configuration environment variables (`SAGA__SERVER__PORT`, ...).
pub const CONFIG_ENV_PREFIX: &str = "SAGA";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SAGA_LOG";

/// One delay stage in the retry ladder.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryStageConfig {
    /// Topic name, e.g. `retry.5s`.
    pub topic: String,
    /// Delay in seconds the re-queuer sleeps before producing back to the
    /// commands topic.
    pub delay_secs: u64,
}

impl RetryStageConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

fn default_retry_stages() -> Vec<RetryStageConfig> {
    vec![
        RetryStageConfig {
            topic: "retry.5s".into(),
            delay_secs: 5,
        },
        RetryStageConfig {
            topic: "retry.30s".into(),
            delay_secs: 30,
        },
        RetryStageConfig {
            topic: "retry.2m".into(),
            delay_secs: 120,
        },
    ]
}

fn default_commands_topic() -> String {
    "commands".into()
}
fn default_acks_topic() -> String {
    "acks".into()
}
fn default_dlq_topic() -> String {
    "dlq".into()
}
fn default_consumer_group(name: &str) -> String {
    format!("saga.{name}")
}
fn default_db_dsn() -> String {
    "sqlite::memory:".into()
}
fn default_result_cache_ttl_secs() -> u64 {
    120
}
fn default_long_poll_timeout_ms() -> u64 {
    5_000
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_max_transient_inline_retries() -> u32 {
    3
}
fn default_gateway_addr() -> String {
    "0.0.0.0:8080".into()
}

/// Main application configuration, covering every item from the
/// specification's Configuration section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection endpoints (unused by the in-memory broker, kept
    /// for parity with a wire-level backend's configuration contract).
    pub broker_endpoints: Vec<String>,
    #[serde(default = "default_commands_topic")]
    pub commands_topic: String,
    #[serde(default = "default_acks_topic")]
    pub acks_topic: String,
    #[serde(default = "default_dlq_topic")]
    pub dlq_topic: String,
    #[serde(default = "default_retry_stages")]
    pub retry_stages: Vec<RetryStageConfig>,
    #[serde(default = "processor_group")]
    pub consumer_group_processor: String,
    #[serde(default = "requeuer_group")]
    pub consumer_group_requeuer: String,
    #[serde(default = "replayer_group")]
    pub consumer_group_replayer: String,
    #[serde(default = "ackcache_group")]
    pub consumer_group_ackcache: String,
    #[serde(default = "default_db_dsn")]
    pub db_dsn: String,
    #[serde(default = "default_result_cache_ttl_secs")]
    pub result_cache_ttl_secs: u64,
    #[serde(default = "default_long_poll_timeout_ms")]
    pub long_poll_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    pub replay_filter_trace_id: Option<String>,
    pub replay_target_topic: Option<String>,
    #[serde(default = "default_max_transient_inline_retries")]
    pub max_transient_inline_retries: u32,
    /// Gateway HTTP bind address. Ambient: the distilled spec names the
    /// HTTP surface but not its bind address.
    #[serde(default = "default_gateway_addr")]
    pub gateway_addr: String,
}

fn processor_group() -> String {
    default_consumer_group("processor")
}
fn requeuer_group() -> String {
    default_consumer_group("requeuer")
}
fn replayer_group() -> String {
    default_consumer_group("replayer")
}
fn ackcache_group() -> String {
    default_consumer_group("ackcache")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_endpoints: vec!["memory://local".into()],
            commands_topic: default_commands_topic(),
            acks_topic: default_acks_topic(),
            dlq_topic: default_dlq_topic(),
            retry_stages: default_retry_stages(),
            consumer_group_processor: processor_group(),
            consumer_group_requeuer: requeuer_group(),
            consumer_group_replayer: replayer_group(),
            consumer_group_ackcache: ackcache_group(),
            db_dsn: default_db_dsn(),
            result_cache_ttl_secs: default_result_cache_ttl_secs(),
            long_poll_timeout_ms: default_long_poll_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            replay_filter_trace_id: None,
            replay_target_topic: None,
            max_transient_inline_retries: default_max_transient_inline_retries(),
            gateway_addr: default_gateway_addr(),
        }
    }
}

impl Config {
    pub fn result_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.result_cache_ttl_secs)
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in the current directory (if present)
    /// 2. The file named by `SAGA_CONFIG` (if set)
    /// 3. Environment variables prefixed `SAGA__`
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false));

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Config for tests: defaults are already hermetic (in-memory broker,
    /// in-memory SQLite), so this is just an alias for readability.
    pub fn for_test() -> Self {
        Self::default()
    }
}
