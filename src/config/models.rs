// src/config/models.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub metrics: MetricsSettings,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.name.trim().is_empty() {
            anyhow::bail!("server.name must not be empty");
        }
        if !matches!(self.server.net_type.as_str(), "tcp" | "tcp4" | "tcp6") {
            anyhow::bail!(
                "server.net_type must be tcp, tcp4 or tcp6 (got {:?})",
                self.server.net_type
            );
        }
        if self.server.buffer_size == Some(0) {
            anyhow::bail!("server.buffer_size must be greater than zero");
        }
        if self.server.backlog == Some(0) {
            anyhow::bail!("server.backlog must be greater than zero");
        }
        if self.server.rate_limit_retention_secs == Some(0) {
            anyhow::bail!("server.rate_limit_retention_secs must be greater than zero");
        }
        if self.server.sweep_interval_secs == Some(0) {
            anyhow::bail!("server.sweep_interval_secs must be greater than zero");
        }
        if self.metrics.enabled && !self.metrics.path.starts_with('/') {
            anyhow::bail!("metrics.path must start with '/'");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub name: String,
    pub net_type: String,
    pub addr: String,
    /// Minimum gap between admitted connections from one host.
    pub rate_limit_ms: Option<u64>,
    /// How long an idle host stays tracked; no eviction when unset.
    pub rate_limit_retention_secs: Option<u64>,
    pub drop_connections: bool,
    pub buffer_size: Option<usize>,
    pub backlog: Option<u32>,
    pub sweep_interval_secs: Option<u64>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "tcp-ack-server".to_string(),
            net_type: "tcp4".to_string(),
            addr: "0.0.0.0:9000".to_string(),
            rate_limit_ms: None,
            rate_limit_retention_secs: None,
            drop_connections: false,
            buffer_size: None,
            backlog: None,
            sweep_interval_secs: None,
        }
    }
}

impl ServerSettings {
    pub fn rate_limit(&self) -> Option<Duration> {
        self.rate_limit_ms.map(Duration::from_millis)
    }

    pub fn rate_limit_retention(&self) -> Option<Duration> {
        self.rate_limit_retention_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9100,
            path: "/metrics".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.server.net_type = "udp".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.backlog = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.metrics.enabled = true;
        config.metrics.path = "metrics".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_helpers() {
        let settings = ServerSettings {
            rate_limit_ms: Some(1500),
            rate_limit_retention_secs: Some(600),
            sweep_interval_secs: Some(30),
            ..ServerSettings::default()
        };
        assert_eq!(settings.rate_limit(), Some(Duration::from_millis(1500)));
        assert_eq!(settings.sweep_interval(), Some(Duration::from_secs(30)));
        assert_eq!(settings.rate_limit_retention(), Some(Duration::from_secs(600)));
    }
}
