use crate::error::{RateLimitError, Result};
use crate::rate_limit::{RateLimitPolicy, StoreFailureMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DlimitConfig {
    /// Shared store all limiters run against
    #[serde(default)]
    pub store: Option<StoreConfig>,

    /// What `check` answers when the store fails
    #[serde(default)]
    pub failure_mode: StoreFailureMode,

    /// Named policies
    #[serde(default)]
    pub policies: BTreeMap<String, RateLimitPolicy>,
}

/// Store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,

    /// Upper bound on a single store round-trip
    #[serde(default, with = "humantime_serde")]
    pub command_timeout: Option<Duration>,
}

impl DlimitConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RateLimitError::Configuration(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Replace the store URL, creating the store section if needed
    pub fn override_store_url(&mut self, url: impl Into<String>) {
        match &mut self.store {
            Some(store) => store.url = url.into(),
            None => {
                self.store = Some(StoreConfig {
                    url: url.into(),
                    command_timeout: None,
                })
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(store) = &self.store {
            if store.url.is_empty() {
                return Err(RateLimitError::Configuration(
                    "Store URL cannot be empty".to_string(),
                ));
            }
            if store.command_timeout.is_some_and(|t| t.is_zero()) {
                return Err(RateLimitError::Configuration(
                    "Store command timeout must be greater than 0".to_string(),
                ));
            }
        }

        for (name, policy) in &self.policies {
            if name.is_empty() {
                return Err(RateLimitError::Configuration(
                    "Policy name cannot be empty".to_string(),
                ));
            }
            policy.validate().map_err(|e| {
                RateLimitError::Configuration(format!("Invalid policy '{}': {}", name, e))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
store:
  url: "redis://127.0.0.1:6379"
  command_timeout: 250ms

failure_mode: fail_open

policies:
  login:
    algorithm: fixed_window
    key_prefix: "login"
    max_count: 3
    window: 2s
  api:
    algorithm: token_bucket
    key_prefix: "api"
    max_tokens: 5
    refill_interval: 2s
    tokens_per_refill: 2
  upload:
    algorithm: leaky_bucket
    key_prefix: "upload"
    rate: 2
    capacity: 5
  daily:
    algorithm: usage_window
    key_prefix: "daily"
    max_count: 1000
    window: 24h
    utc_offset_secs: 28800
"#;

    #[test]
    fn test_parse_valid_config() {
        let config = DlimitConfig::from_yaml(SAMPLE).unwrap();
        let store = config.store.as_ref().unwrap();
        assert_eq!(store.url, "redis://127.0.0.1:6379");
        assert_eq!(store.command_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.failure_mode, StoreFailureMode::FailOpen);
        assert_eq!(config.policies.len(), 4);
        assert_eq!(config.policies["upload"].algorithm(), "leaky_bucket");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_values() {
        let config = DlimitConfig::from_yaml("policies: {}").unwrap();
        assert!(config.store.is_none());
        assert_eq!(config.failure_mode, StoreFailureMode::Propagate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_policy() {
        let yaml = r#"
policies:
  broken:
    algorithm: leaky_bucket
    key_prefix: "b"
    rate: 0
    capacity: 5
"#;
        let config = DlimitConfig::from_yaml(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_unknown_algorithm_fails_to_parse() {
        let yaml = r#"
policies:
  odd:
    algorithm: sliding_log
    key_prefix: "odd"
"#;
        assert!(matches!(
            DlimitConfig::from_yaml(yaml),
            Err(RateLimitError::Configuration(_))
        ));
    }

    #[test]
    fn test_override_store_url() {
        let mut config = DlimitConfig::default();
        config.override_store_url("redis://cache:6379");
        assert_eq!(config.store.as_ref().unwrap().url, "redis://cache:6379");

        let mut config = DlimitConfig::from_yaml(SAMPLE).unwrap();
        config.override_store_url("redis://other:6379");
        let store = config.store.unwrap();
        assert_eq!(store.url, "redis://other:6379");
        assert_eq!(store.command_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = DlimitConfig::from_file(file.path()).unwrap();
        assert_eq!(config.policies.len(), 4);

        assert!(DlimitConfig::from_file("/nonexistent/dlimit.yaml").is_err());
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/dlimit.yaml");
        let config = DlimitConfig::from_file(path).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.store.is_some());
    }
}
