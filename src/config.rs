//! Configuration management for Tollgate.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `TOLLGATE__*` environment variables (for example
//! `TOLLGATE__SERVER__GRPC_ADDR=0.0.0.0:8081`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Result, TollgateError};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Limiter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Path to a YAML file of rules seeding limits for new keys
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Where limiter state is kept
    #[serde(default)]
    pub store: StoreConfig,
}

/// Backend used to persist limiter state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process map; state is lost on restart
    #[default]
    Memory,
    /// One JSON document per key under `dir`
    File { dir: PathBuf },
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional file path and the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix("TOLLGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<TollgateConfig>())
            .map_err(|e| TollgateError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert_eq!(config.server.grpc_addr, "127.0.0.1:8081".parse().unwrap());
        assert_eq!(config.limiter.store, StoreConfig::Memory);
        assert!(config.limiter.rules_path.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_load_full_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
server:
  grpc_addr: "0.0.0.0:9000"
limiter:
  rules_path: /etc/tollgate/rules.yaml
  store:
    kind: file
    dir: /var/lib/tollgate
logging:
  json: true
"#
        )
        .unwrap();

        let config = TollgateConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.server.grpc_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(
            config.limiter.rules_path.as_deref(),
            Some("/etc/tollgate/rules.yaml")
        );
        assert_eq!(
            config.limiter.store,
            StoreConfig::File {
                dir: PathBuf::from("/var/lib/tollgate")
            }
        );
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_layers_file_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "logging:\n  level: debug").unwrap();

        let config = TollgateConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.server.grpc_addr, default_grpc_addr());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = TollgateConfig::load(Some("/nonexistent/tollgate.yaml"));
        assert!(matches!(result, Err(TollgateError::Config(_))));
    }
}
