//! Configuration for the mock server.
//!
//! Defines the listen address, database location, logging and matching settings.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::Level;

/// Main configuration for the mock server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockServerConfig {
    /// HTTP listener
    #[serde(default)]
    pub server: ServerConfig,

    /// SQLite storage
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl MockServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.logging.level()?;
        if self.database.path.as_os_str().is_empty() {
            anyhow::bail!("Database path cannot be empty");
        }
        Ok(())
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite file, created on first start
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("unimock.db")
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
}

impl LoggingConfig {
    /// Parsed log level.
    pub fn level(&self) -> anyhow::Result<Level> {
        self.level
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid log level: {}", self.level))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log every matched message
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log messages no trigger fired for
    #[serde(default = "default_true")]
    pub log_unmatched: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  listen: 127.0.0.1:9090
database:
  path: /var/lib/unimock/mock.db
logging:
  level: debug
settings:
  log_matches: false
"#;
        let config = MockServerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9090".parse().unwrap());
        assert_eq!(config.database.path, PathBuf::from("/var/lib/unimock/mock.db"));
        assert_eq!(config.logging.level().unwrap(), Level::DEBUG);
        assert!(!config.settings.log_matches);
        assert!(config.settings.log_unmatched);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = MockServerConfig::from_yaml("{}").unwrap();
        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.database.path, PathBuf::from("unimock.db"));
        assert_eq!(config.logging.level().unwrap(), Level::INFO);
        assert!(config.settings.log_matches);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
server:
  listen: 127.0.0.1:9090
  socket: /tmp/mock.sock
"#;
        assert!(MockServerConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let yaml = r#"
logging:
  level: loud
"#;
        let err = MockServerConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unimock.yaml");
        std::fs::write(&path, "database:\n  path: other.db\n").unwrap();

        let config = MockServerConfig::from_file(&path).unwrap();
        assert_eq!(config.database.path, PathBuf::from("other.db"));
    }

    #[test]
    fn test_default_config_file_parses() {
        let config = MockServerConfig::from_yaml(include_str!("../config/default-config.yaml")).unwrap();
        assert_eq!(config.server.listen.port(), 8080);
    }
}
