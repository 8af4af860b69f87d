//! Listen and metrics configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_port")]
    pub port: u16,
    /// Number of worker threads (0 = auto-detect CPU count)
    #[serde(default)]
    pub workers: usize,
}

fn default_listen_port() -> u16 {
    8080
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            workers: 0,
        }
    }
}

impl ListenConfig {
    /// Effective worker thread count.
    pub fn worker_threads(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}
