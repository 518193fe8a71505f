//! Configuration management for Tollgate.
//!
//! Settings come from an optional YAML file layered under environment
//! variables of the form `TOLLGATE__RATE_LIMITING__REDIS__URL`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{BackendKind, PolicyOverride, PolicyRegistry};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Bearer tokens accepted by the authentication gate
    #[serde(default)]
    pub auth: AuthConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Which counter store to run with
    #[serde(default)]
    pub backend: BackendKind,

    /// How often the local store drops expired windows, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Shared store settings, used by the distributed backend
    #[serde(default)]
    pub redis: RedisSettings,

    /// Per-policy overrides of the built-in table
    #[serde(default)]
    pub policies: HashMap<String, PolicyOverride>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            sweep_interval_secs: default_sweep_interval(),
            redis: RedisSettings::default(),
            policies: HashMap::new(),
        }
    }
}

impl RateLimitingConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_sweep_interval() -> u64 {
    60
}

/// Shared store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Distributed mode is opt-in
    #[serde(default)]
    pub enabled: bool,

    /// Connection URL, including credentials
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for every key written
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on each store call, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl RedisSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_key_prefix() -> String {
    "tollgate:ratelimit".to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Accepted bearer tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// One accepted bearer token and the subject it authenticates as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub subject: String,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Load an optional YAML file, then apply environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(path, config::FileFormat::Yaml).required(true),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Build and validate the policy table.
    pub fn policy_registry(&self) -> Result<PolicyRegistry> {
        PolicyRegistry::with_overrides(&self.rate_limiting.policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert_eq!(config.server.http_addr, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(config.rate_limiting.backend, BackendKind::Local);
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::from_secs(60));
        assert!(!config.rate_limiting.redis.enabled);
        assert_eq!(config.rate_limiting.redis.timeout(), Duration::from_millis(1000));
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
server:
  http_addr: 0.0.0.0:9000
rate_limiting:
  backend: distributed
  redis:
    enabled: true
    url: redis://cache:6379
    timeout_ms: 250
  policies:
    wallet-ops:
      limit: 20
      window: 1
      unit: minute
auth:
  tokens:
    - token: secret
      subject: alice
logging:
  format: json
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.rate_limiting.backend, BackendKind::Distributed);
        assert_eq!(config.rate_limiting.redis.url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.rate_limiting.redis.key_prefix, "tollgate:ratelimit");
        assert_eq!(config.auth.tokens[0].subject, "alice");
        assert_eq!(config.logging.format, LogFormat::Json);

        let registry = config.policy_registry().unwrap();
        assert_eq!(registry.lookup("wallet-ops").unwrap().limit(), 20);
    }

    #[test]
    fn test_unknown_policy_fails_at_load() {
        let yaml = r#"
rate_limiting:
  policies:
    bogus:
      limit: 1
      window: 1
      unit: second
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert!(matches!(
            config.policy_registry(),
            Err(TollgateError::PolicyNotFound(_))
        ));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = assert_ok!(TollgateConfig::load(None));
        assert_eq!(config.rate_limiting.redis.key_prefix, "tollgate:ratelimit");
    }

    #[test]
    fn test_load_missing_file_is_an_error() {
        assert_err!(TollgateConfig::load(Some("/nonexistent/tollgate.yaml")));
    }
}
