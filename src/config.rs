//! Broker configuration.
//!
//! Supports configuration from:
//! - TOML file (default: `tinymq.toml`)
//! - Environment variables with `TINYMQ__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `TINYMQ__SERVER__BIND=0.0.0.0:1884`
//! - `TINYMQ__LIMITS__MAX_PACKET_SIZE=2097152`
//! - `TINYMQ__LOG__LEVEL=debug`

use std::net::SocketAddr;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

/// Default maximum packet size (1MB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 1024 * 1024;

/// MQTT protocol maximum packet size.
const PROTOCOL_MAX_PACKET_SIZE: u32 = 268_435_455;

/// Default MQTT bind address.
const DEFAULT_BIND: &str = "0.0.0.0:1883";

/// Default Prometheus metrics bind address.
const DEFAULT_PROMETHEUS_BIND: &str = "127.0.0.1:9090";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// Server configuration.
    pub server: ServerConfig,
    /// Limits configuration.
    pub limits: LimitsConfig,
    /// Prometheus metrics configuration.
    pub prometheus: PrometheusConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

fn default_bind() -> SocketAddr {
    DEFAULT_BIND.parse().unwrap()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Limits configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum MQTT packet size in bytes (0 = protocol maximum).
    /// Packets exceeding this close the offending connection.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
}

fn default_max_packet_size() -> u32 {
    DEFAULT_MAX_PACKET_SIZE
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    /// Enable the Prometheus metrics endpoint.
    pub enabled: bool,
    /// HTTP bind address for the metrics endpoint.
    #[serde(default = "default_prometheus_bind")]
    pub bind: SocketAddr,
}

fn default_prometheus_bind() -> SocketAddr {
    DEFAULT_PROMETHEUS_BIND.parse().unwrap()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_prometheus_bind(),
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// Config parsing/loading error.
    Config(config::ConfigError),
    /// Invalid configuration value.
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error; defaults apply. Two forms of
    /// environment variable usage are supported:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` in the TOML file
    /// 2. Override via env vars with `TINYMQ__` prefix and double underscores:
    ///    `TINYMQ__SERVER__BIND=0.0.0.0:1884`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", DEFAULT_BIND)?
            .set_default("limits.max_packet_size", DEFAULT_MAX_PACKET_SIZE as i64)?
            .set_default("prometheus.enabled", false)?
            .set_default("prometheus.bind", DEFAULT_PROMETHEUS_BIND)?;

        let path = path.as_ref();
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    let substituted = substitute_env_vars(&content);
                    builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
                }
                Err(e) => return Err(ConfigError::Io(e)),
            }
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("TINYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (for testing).
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content);
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_packet_size > PROTOCOL_MAX_PACKET_SIZE {
            return Err(ConfigError::Validation(
                "max_packet_size cannot exceed MQTT protocol maximum (268,435,455)".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind.port(), 1883);
        assert_eq!(config.limits.max_packet_size, DEFAULT_MAX_PACKET_SIZE);
        assert!(!config.prometheus.enabled);
    }

    #[test]
    fn test_invalid_max_packet_size() {
        let mut config = Config::default();
        config.limits.max_packet_size = 300_000_000; // Exceeds MQTT max
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[log]
level = "debug"

[server]
bind = "127.0.0.1:1884"

[limits]
max_packet_size = 2097152

[prometheus]
enabled = true
bind = "127.0.0.1:9191"
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.server.bind.port(), 1884);
        assert_eq!(config.limits.max_packet_size, 2097152);
        assert!(config.prometheus.enabled);
        assert_eq!(config.prometheus.bind.port(), 9191);
    }

    #[test]
    fn test_parse_partial_toml() {
        // Only override some values, rest should use defaults
        let toml = r#"
[limits]
max_packet_size = 512000
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.limits.max_packet_size, 512000);
        assert_eq!(config.server.bind, default_bind());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("TEST_TINYMQ_PORT", "1885");
        let content = r#"
[server]
bind = "0.0.0.0:${TEST_TINYMQ_PORT}"
"#;
        let substituted = substitute_env_vars(content);
        assert!(substituted.contains("0.0.0.0:1885"));
        std::env::remove_var("TEST_TINYMQ_PORT");
    }

    #[test]
    fn test_env_var_substitution_with_default() {
        std::env::remove_var("NONEXISTENT_VAR");
        let content = r#"bind = "${NONEXISTENT_VAR:-0.0.0.0:1883}""#;
        let substituted = substitute_env_vars(content);
        assert!(substituted.contains("0.0.0.0:1883"));
    }
}
