//! Configuration for the broker.
//!
//! Supports YAML file and environment variable overrides.

use serde::Deserialize;
use std::path::Path;

use crate::broker::codec::codec_by_name;
use crate::broker::BrokerOptions;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "NSQ_BROKER_CONFIG";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "NSQ_BROKER_LOG";
/// Comma-separated nsqd TCP addresses.
pub const ADDRS_ENV_VAR: &str = "NSQ_BROKER_ADDRS";
/// Comma-separated nsqlookupd HTTP addresses.
pub const LOOKUPD_ADDRS_ENV_VAR: &str = "NSQ_BROKER_LOOKUPD_ADDRS";
/// Codec name.
pub const CODEC_ENV_VAR: &str = "NSQ_BROKER_CODEC";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
}

/// Broker section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Registry name of the broker to build.
    pub name: String,
    /// nsqd TCP addresses used by producers (and by consumers without lookupd).
    pub addrs: Vec<String>,
    /// nsqlookupd HTTP addresses. Consumers use these when set.
    pub lookupd_addrs: Vec<String>,
    /// Envelope codec name.
    pub codec: String,
    /// Client tuning overrides, `key=value`.
    pub client_opts: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "nsq".to_string(),
            addrs: Vec::new(),
            lookupd_addrs: Vec::new(),
            codec: "json".to_string(),
            client_opts: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addrs) = std::env::var(ADDRS_ENV_VAR) {
            self.broker.addrs = split_list(&addrs);
        }

        if let Ok(addrs) = std::env::var(LOOKUPD_ADDRS_ENV_VAR) {
            self.broker.lookupd_addrs = split_list(&addrs);
        }

        if let Ok(codec) = std::env::var(CODEC_ENV_VAR) {
            self.broker.codec = codec;
        }
    }

    /// Broker options described by this configuration.
    pub fn broker_options(&self) -> Result<BrokerOptions, ConfigError> {
        let codec = codec_by_name(&self.broker.codec)
            .ok_or_else(|| ConfigError::UnknownCodec(self.broker.codec.clone()))?;

        let mut options = BrokerOptions::new()
            .with_addrs(self.broker.addrs.iter().cloned())
            .with_lookupd_addrs(self.broker.lookupd_addrs.iter().cloned())
            .with_codec(codec);
        for opt in &self.broker.client_opts {
            options = options.with_client_opt(opt.clone());
        }
        Ok(options)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Unknown codec '{0}'")]
    UnknownCodec(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for var in [CONFIG_ENV_VAR, ADDRS_ENV_VAR, LOOKUPD_ADDRS_ENV_VAR, CODEC_ENV_VAR] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.broker.name, "nsq");
        assert_eq!(config.broker.codec, "json");
        assert!(config.broker.addrs.is_empty());
        assert!(config.broker.lookupd_addrs.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
broker:
  addrs:
    - 10.0.0.1:4150
    - 10.0.0.2:4150
  lookupd_addrs:
    - 10.0.0.9:4161
  client_opts:
    - max_attempts=10
    - dial_timeout=2s
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.broker.name, "nsq");
        assert_eq!(config.broker.addrs, vec!["10.0.0.1:4150", "10.0.0.2:4150"]);
        assert_eq!(config.broker.lookupd_addrs, vec!["10.0.0.9:4161"]);
        assert_eq!(config.broker.client_opts.len(), 2);
        assert_eq!(config.broker.codec, "json");
    }

    #[test]
    fn test_broker_options() {
        let mut config = Config::default();
        config.broker.addrs = vec!["10.0.0.1:4150".to_string()];
        config.broker.client_opts = vec!["max_attempts=10".to_string()];

        let options = config.broker_options().unwrap();
        assert_eq!(options.addrs, vec!["10.0.0.1:4150"]);
        assert_eq!(options.codec.name(), "json");
        assert_eq!(options.client_opts, vec!["max_attempts=10"]);
    }

    #[test]
    fn test_unknown_codec() {
        let mut config = Config::default();
        config.broker.codec = "protobuf".to_string();

        let result = config.broker_options();
        assert!(matches!(result, Err(ConfigError::UnknownCodec(name)) if name == "protobuf"));
    }

    #[test]
    fn test_from_file_missing() {
        let result = Config::from_file("/nonexistent/nsq-broker.yaml");
        assert!(matches!(result, Err(ConfigError::FileRead(_, _))));
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "broker: [not, a, map").unwrap();

        let result = Config::from_file(file.path().to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    #[serial]
    fn test_load_from_env_path_with_overrides() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "broker:\n  addrs: [10.0.0.1:4150]\n  codec: json").unwrap();

        std::env::set_var(CONFIG_ENV_VAR, file.path());
        std::env::set_var(LOOKUPD_ADDRS_ENV_VAR, " 10.0.0.9:4161, ,10.0.0.10:4161 ");

        let config = Config::load().unwrap();
        clear_env();

        assert_eq!(config.broker.addrs, vec!["10.0.0.1:4150"]);
        assert_eq!(
            config.broker.lookupd_addrs,
            vec!["10.0.0.9:4161", "10.0.0.10:4161"]
        );
    }

    #[test]
    #[serial]
    fn test_load_missing_file_uses_defaults() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(CONFIG_ENV_VAR, dir.path().join("absent.yaml"));
        std::env::set_var(ADDRS_ENV_VAR, "10.0.0.5:4150");

        let config = Config::load().unwrap();
        clear_env();

        assert_eq!(config.broker.addrs, vec!["10.0.0.5:4150"]);
        assert_eq!(config.broker.codec, "json");
    }
}
