//! Configuration data structures for Portico.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. They are
//! serde-friendly and carry defaults so that minimal configs remain concise. Durations
//! are kept as humantime strings ("30s", "1h", "30d") and parsed through accessors.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where the gateway runs. Development enables the tenant override parameter.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

/// Limits applied to tenant-authored `function` body transforms.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptLimits {
    /// Maximum number of engine operations per run (0 = unlimited)
    pub max_operations: u64,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_call_levels: usize,
    /// Deadline used when a transform declares none
    pub default_timeout_ms: u64,
    /// Upper bound for any declared deadline
    pub max_timeout_ms: u64,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
            max_string_size: 1_000_000,
            max_array_size: 10_000,
            max_map_size: 10_000,
            max_call_levels: 32,
            default_timeout_ms: 1_000,
            max_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionLogConfig {
    pub enabled: bool,
    /// How long log records are kept, e.g. "30d"
    pub retention: String,
    /// Hard cap for captured request/response bodies
    pub max_body_bytes: usize,
}

impl Default for ExecutionLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention: "30d".to_string(),
            max_body_bytes: 10 * 1024,
        }
    }
}

impl ExecutionLogConfig {
    pub fn retention(&self) -> Duration {
        parse_duration_or(&self.retention, Duration::from_secs(30 * 24 * 3600))
    }
}

/// Source of the administrative document set (gateways and routes).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to a seed file, or an http(s) URL serving one
    pub seed: Option<String>,
    /// Poll interval for URL seeds, e.g. "30s"
    pub poll_interval: Option<String>,
}

impl StoreConfig {
    pub fn is_remote(&self) -> bool {
        self.seed
            .as_deref()
            .is_some_and(|s| s.starts_with("http://") || s.starts_with("https://"))
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
            .as_deref()
            .map(|s| parse_duration_or(s, Duration::from_secs(30)))
            .unwrap_or(Duration::from_secs(30))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    /// Emit JSON lines instead of the pretty console format
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub environment: Environment,
    /// Query parameter naming the tenant outside production
    pub tenant_override_param: String,
    pub max_request_body_bytes: usize,
    /// TTL of flattened gateway snapshots in the key-value store
    pub config_cache_ttl: String,
    /// Upstream timeout when neither the route nor the gateway sets one
    pub upstream_timeout: String,
    pub execution_log: ExecutionLogConfig,
    pub script: ScriptLimits,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub shutdown_timeout: String,
    /// How often expired key-value entries are swept
    pub kv_sweep_interval: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            environment: Environment::default(),
            tenant_override_param: "_gateway".to_string(),
            max_request_body_bytes: 10 * 1024 * 1024,
            config_cache_ttl: "1h".to_string(),
            upstream_timeout: "30s".to_string(),
            execution_log: ExecutionLogConfig::default(),
            script: ScriptLimits::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
            shutdown_timeout: "30s".to_string(),
            kv_sweep_interval: "60s".to_string(),
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    pub fn config_cache_ttl(&self) -> Duration {
        parse_duration_or(&self.config_cache_ttl, Duration::from_secs(3600))
    }

    pub fn upstream_timeout(&self) -> Duration {
        parse_duration_or(&self.upstream_timeout, Duration::from_secs(30))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        parse_duration_or(&self.shutdown_timeout, Duration::from_secs(30))
    }

    pub fn kv_sweep_interval(&self) -> Duration {
        parse_duration_or(&self.kv_sweep_interval, Duration::from_secs(60))
    }
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.config.environment = environment;
        self
    }

    pub fn upstream_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.config.upstream_timeout = timeout.into();
        self
    }

    pub fn config_cache_ttl(mut self, ttl: impl Into<String>) -> Self {
        self.config.config_cache_ttl = ttl.into();
        self
    }

    pub fn max_request_body_bytes(mut self, bytes: usize) -> Self {
        self.config.max_request_body_bytes = bytes;
        self
    }

    pub fn execution_log(mut self, config: ExecutionLogConfig) -> Self {
        self.config.execution_log = config;
        self
    }

    pub fn script(mut self, limits: ScriptLimits) -> Self {
        self.config.script = limits;
        self
    }

    pub fn seed(mut self, seed: impl Into<String>) -> Self {
        self.config.store.seed = Some(seed.into());
        self
    }

    /// Build the configuration, rejecting unparsable durations.
    pub fn build(self) -> Result<ServerConfig, String> {
        for (name, value) in [
            ("config_cache_ttl", &self.config.config_cache_ttl),
            ("upstream_timeout", &self.config.upstream_timeout),
            ("shutdown_timeout", &self.config.shutdown_timeout),
            ("kv_sweep_interval", &self.config.kv_sweep_interval),
        ] {
            humantime::parse_duration(value).map_err(|e| format!("{name}: {e}"))?;
        }
        Ok(self.config)
    }
}

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}
