use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::prober::ProbeSettings;
use crate::worker::WorkerSettings;

pub const CONFIG_PATH_ENV: &str = "NETPULSE_CONFIG";
pub const TARGETS_ENV: &str = "NETPULSE_TARGETS";
pub const API_PORT_ENV: &str = "NETPULSE_API_PORT";
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PingerConfig {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default = "default_offline_after")]
    pub offline_after_secs: u64,
    #[serde(default = "default_liveness_interval")]
    pub liveness_check_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_topic_base")]
    pub topic_base: String,
    pub webhook_url: Option<String>,
}

fn default_offline_after() -> u64 { 30 }
fn default_liveness_interval() -> u64 { 5 }
fn default_heartbeat_interval() -> u64 { 600 }
fn default_probe_interval() -> u64 { 5 }
fn default_probe_timeout() -> u64 { 3500 }
fn default_api_port() -> u16 { 3000 }
fn default_topic_base() -> String { "netpulse".into() }

impl Default for PingerConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            offline_after_secs: default_offline_after(),
            liveness_check_interval_secs: default_liveness_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            probe_interval_secs: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            api_port: default_api_port(),
            topic_base: default_topic_base(),
            webhook_url: None,
        }
    }
}

impl PingerConfig {
    /// Reads the file named by `NETPULSE_CONFIG` (or `config.json`) and applies
    /// environment overrides. A missing file is tolerated only when targets
    /// come from the environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let env_targets = std::env::var(TARGETS_ENV).ok();

        let mut config = if Path::new(&path).exists() || env_targets.is_none() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        if let Some(targets) = env_targets {
            config.targets = targets.split(',').map(|t| t.trim().to_string()).collect();
        }
        if let Ok(port) = std::env::var(API_PORT_ENV) {
            config.api_port = port
                .parse()
                .with_context(|| format!("Invalid {}: {}", API_PORT_ENV, port))?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("offline_after_secs", self.offline_after_secs),
            ("liveness_check_interval_secs", self.liveness_check_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("probe_interval_secs", self.probe_interval_secs),
            ("probe_timeout_ms", self.probe_timeout_ms),
        ] {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.topic_base.is_empty() || self.topic_base.contains('/') {
            bail!("topic_base must be a single non-empty topic segment");
        }
        Ok(())
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            liveness_interval: Duration::from_secs(self.liveness_check_interval_secs),
            offline_after: Duration::from_secs(self.offline_after_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
        }
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_secs(self.probe_interval_secs),
            timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn clear_env() {
        std::env::remove_var(CONFIG_PATH_ENV);
        std::env::remove_var(TARGETS_ENV);
        std::env::remove_var(API_PORT_ENV);
    }

    #[test]
    fn test_defaults_applied() {
        let file = write_config(r#"{ "targets": ["10.0.0.5"] }"#);
        let config = PingerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.targets, vec!["10.0.0.5"]);
        assert_eq!(config.offline_after_secs, 30);
        assert_eq!(config.heartbeat_interval_secs, 600);
        assert_eq!(config.topic_base, "netpulse");
        assert!(config.webhook_url.is_none());
    }

    #[test]
    fn test_settings_conversion() {
        let config = PingerConfig {
            offline_after_secs: 45,
            probe_timeout_ms: 900,
            ..Default::default()
        };
        assert_eq!(config.worker_settings().offline_after, Duration::from_secs(45));
        assert_eq!(config.probe_settings().timeout, Duration::from_millis(900));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = PingerConfig {
            liveness_check_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_topic_base_rejected() {
        let config = PingerConfig {
            topic_base: "a/b".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparsable_file() {
        let file = write_config("{ not json");
        assert!(PingerConfig::from_file(file.path()).is_err());
    }

    #[test]
    #[serial]
    fn test_load_with_env_overrides() {
        clear_env();
        let file = write_config(r#"{ "targets": ["10.0.0.1"], "api_port": 8080 }"#);
        std::env::set_var(CONFIG_PATH_ENV, file.path());
        std::env::set_var(TARGETS_ENV, "10.0.0.5, router.lan");
        std::env::set_var(API_PORT_ENV, "9090");

        let config = PingerConfig::load().unwrap();
        clear_env();

        assert_eq!(config.targets, vec!["10.0.0.5", "router.lan"]);
        assert_eq!(config.api_port, 9090);
    }

    #[test]
    #[serial]
    fn test_load_missing_file_without_env_targets_fails() {
        clear_env();
        std::env::set_var(CONFIG_PATH_ENV, "/nonexistent/netpulse.json");
        let result = PingerConfig::load();
        clear_env();
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_load_missing_file_with_env_targets() {
        clear_env();
        std::env::set_var(CONFIG_PATH_ENV, "/nonexistent/netpulse.json");
        std::env::set_var(TARGETS_ENV, "10.0.0.5");
        let config = PingerConfig::load().unwrap();
        clear_env();
        assert_eq!(config.targets, vec!["10.0.0.5"]);
        assert_eq!(config.liveness_check_interval_secs, 5);
    }
}
