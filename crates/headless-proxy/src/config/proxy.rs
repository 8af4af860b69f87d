//! Rendering proxy settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxySettings {
    /// Base URL every request path is resolved against.
    pub upstream: String,

    /// Per-request deadline in seconds, covering page setup through extraction.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_true")]
    pub enable_js: bool,

    #[serde(default)]
    pub forward_cookies: bool,

    /// Inbound headers injected on the engine's sub-requests and mixed into
    /// cache fingerprints. Matched case-insensitively.
    #[serde(default = "default_forward_headers")]
    pub forward_headers: Vec<String>,

    /// Cache entry lifetime in seconds; 0 disables caching.
    #[serde(default)]
    pub cache_ttl: u64,

    #[serde(default = "default_max_browsers")]
    pub max_browsers: usize,

    #[serde(default)]
    pub optimize_resources: bool,

    #[serde(default)]
    pub compress_images: bool,

    #[serde(default)]
    pub minify_content: bool,

    /// Largest inbound request body accepted, in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_true() -> bool {
    true
}

fn default_forward_headers() -> Vec<String> {
    vec!["Accept-Language".to_string(), "User-Agent".to_string()]
}

fn default_max_browsers() -> usize {
    5
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl ProxySettings {
    /// Settings with every option at its default.
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            timeout: default_timeout(),
            user_agent: default_user_agent(),
            enable_js: true,
            forward_cookies: false,
            forward_headers: default_forward_headers(),
            cache_ttl: 0,
            max_browsers: default_max_browsers(),
            optimize_resources: false,
            compress_images: false,
            minify_content: false,
            max_body_bytes: default_max_body_bytes(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }
}
