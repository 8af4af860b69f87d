//! Health report served at `/_health/headless-proxy`.

use crate::cache::ResponseCache;
use crate::pool::health::{HealthState, OverallHealth};
use crate::pool::SessionPool;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

pub const HEALTH_PATH: &str = "/_health/headless-proxy";

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: OverallHealth,
    pub uptime: String,
    pub browser_pool: PoolStatus,
    pub cache: CacheStatus,
    pub system_resources: SystemResources,
    pub version: &'static str,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub max_size: usize,
    pub healthy_count: usize,
    pub unhealthy_count: usize,
}

#[derive(Debug, Serialize)]
pub struct CacheStatus {
    pub enabled: bool,
    pub size: usize,
    pub hit_rate: f64,
    pub ttl: u64,
}

#[derive(Debug, Serialize)]
pub struct SystemResources {
    pub memory_usage_mb: f64,
    pub worker_threads: usize,
    pub cpu_count: usize,
}

impl HealthReport {
    /// HTTP status for this report: 200 only when healthy.
    pub fn http_status(&self) -> u16 {
        if self.status == OverallHealth::Healthy {
            200
        } else {
            503
        }
    }
}

/// Everything the report reads from.
pub struct StatusSource {
    pub pool: Arc<SessionPool>,
    pub cache: Arc<ResponseCache>,
    pub health: Arc<HealthState>,
    pub started_at: Instant,
}

impl StatusSource {
    pub fn report(&self) -> HealthReport {
        let healthy_count = self.health.healthy_count();
        let unhealthy_count = self.health.unhealthy_count();
        HealthReport {
            status: OverallHealth::from_counts(healthy_count, unhealthy_count),
            uptime: format_uptime(self.started_at.elapsed().as_secs()),
            browser_pool: PoolStatus {
                size: self.pool.size(),
                max_size: self.pool.max_size(),
                healthy_count,
                unhealthy_count,
            },
            cache: CacheStatus {
                enabled: self.cache.is_enabled(),
                size: self.cache.len(),
                hit_rate: self.cache.hit_rate(),
                ttl: self.cache.ttl().as_secs(),
            },
            system_resources: SystemResources {
                memory_usage_mb: resident_memory_mb(),
                worker_threads: tokio::runtime::Handle::try_current()
                    .map(|h| h.metrics().num_workers())
                    .unwrap_or(0),
                cpu_count: num_cpus::get(),
            },
            version: env!("CARGO_PKG_VERSION"),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

fn format_uptime(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Peak resident set size of this process in MiB.
#[cfg(unix)]
fn resident_memory_mb() -> f64 {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the provided struct.
    let ret = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if ret != 0 {
        return 0.0;
    }
    // SAFETY: initialised by the successful call above.
    let usage = unsafe { usage.assume_init() };
    let max_rss = usage.ru_maxrss as f64;
    if cfg!(target_os = "macos") {
        max_rss / 1024.0 / 1024.0
    } else {
        max_rss / 1024.0
    }
}

#[cfg(not(unix))]
fn resident_memory_mb() -> f64 {
    0.0
}
