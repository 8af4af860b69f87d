//! Configuration types for headless-proxy.

mod engine;
mod listen;
mod proxy;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use engine::{EngineConfig, HealthConfig};
pub use listen::{ListenConfig, MetricsConfig};
pub use proxy::{ProxySettings, DEFAULT_USER_AGENT};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub proxy: ProxySettings,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    /// Configuration for `upstream` with every other option at its default.
    pub fn for_upstream(upstream: impl Into<String>) -> Self {
        Self {
            listen: ListenConfig::default(),
            metrics: MetricsConfig::default(),
            proxy: ProxySettings::new(upstream),
            health: HealthConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, anyhow::Error> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let upstream = self.proxy.upstream.trim();
        if upstream.is_empty() {
            anyhow::bail!("'proxy.upstream' is required");
        }

        let url = url::Url::parse(upstream)
            .map_err(|e| anyhow::anyhow!("Invalid upstream URL '{upstream}': {e}"))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            anyhow::bail!(
                "Unsupported upstream scheme: '{}'. Currently supported: http, https",
                url.scheme()
            );
        }
        if url.host_str().is_none() {
            anyhow::bail!("Upstream URL '{upstream}' has no host");
        }

        if self.proxy.max_browsers == 0 {
            anyhow::bail!("'proxy.max_browsers' must be at least 1");
        }
        if self.proxy.timeout == 0 {
            anyhow::bail!("'proxy.timeout' must be at least 1 second");
        }
        if self.proxy.max_body_bytes == 0 {
            anyhow::bail!("'proxy.max_body_bytes' must be at least 1");
        }

        for name in &self.proxy.forward_headers {
            hyper::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| anyhow::anyhow!("Invalid header name in 'proxy.forward_headers': '{name}'"))?;
        }

        if self.health.interval_secs == 0 || self.health.probe_timeout_secs == 0 {
            anyhow::bail!("'health.interval_secs' and 'health.probe_timeout_secs' must be positive");
        }

        Ok(())
    }
}
