use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ProxyError;

fn default_listen_addr() -> String {
    "127.0.0.1:44380".to_string()
}

fn default_idle_secs() -> u64 {
    60
}

fn default_connect_secs() -> u64 {
    10
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Upstream proxy endpoint and the credentials presented to it.
///
/// Changes take effect on the next service start; a running server keeps the
/// credentials it was constructed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for UpstreamProxyConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// PAC script path. Absent, unreadable or unparsable scripts degrade to
    /// "always use the upstream proxy".
    #[serde(default)]
    pub pac_file_path: Option<PathBuf>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            pac_file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Per-connection idle read timeout in seconds.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    /// Outbound TCP connect timeout in seconds.
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    /// How long Stop waits for in-flight connections before force-closing.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_secs: default_idle_secs(),
            connect_secs: default_connect_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: UpstreamProxyConfig,
    #[serde(default)]
    pub serve: ServeConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: UpstreamProxyConfig::default(),
            serve: ServeConfig::default(),
            timeouts: TimeoutConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("can't read config {path}: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("can't parse config {path}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.serve.listen_addr, "127.0.0.1:44380");
        assert!(config.serve.pac_file_path.is_none());
        assert_eq!(config.timeouts.idle_secs, 60);
        assert_eq!(config.timeouts.connect_secs, 10);
        assert_eq!(config.timeouts.shutdown_grace_secs, 10);
        assert_eq!(config.log_level, "info");
        assert!(config.proxy.url.is_empty());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let json = r#"{
            "proxy": {
                "url": "http://proxy.corp:3128",
                "username": "alice",
                "password": "secret"
            },
            "serve": { "listen_addr": "0.0.0.0:8080" }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.proxy.url, "http://proxy.corp:3128");
        assert_eq!(config.proxy.username, "alice");
        assert_eq!(config.serve.listen_addr, "0.0.0.0:8080");
        assert!(config.serve.pac_file_path.is_none());
        assert_eq!(config.timeouts.shutdown_grace_secs, 10);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = Config::from_file("/nonexistent/pacgate.json").unwrap_err();
        assert!(err.to_string().contains("can't read config"));
    }
}
