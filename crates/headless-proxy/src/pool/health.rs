//! Background health monitor for pooled sessions.
//!
//! Every interval the monitor probes each idle session with a trivial script in
//! an auxiliary context. A session that fails or misses the probe deadline is
//! swapped for a freshly created one; if that creation fails the sick session
//! is closed and its slot dropped.

use super::{ReplaceOutcome, SessionPool};
use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const PROBE_SCRIPT: &str = "1+1";

/// Overall verdict derived from the last cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallHealth {
    pub fn from_counts(healthy: usize, unhealthy: usize) -> Self {
        match (healthy, unhealthy) {
            (_, 0) => OverallHealth::Healthy,
            (0, _) => OverallHealth::Unhealthy,
            _ => OverallHealth::Degraded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverallHealth::Healthy => "healthy",
            OverallHealth::Degraded => "degraded",
            OverallHealth::Unhealthy => "unhealthy",
        }
    }
}

/// Results of the most recent cycle, shared with the health endpoint.
#[derive(Default)]
pub struct HealthState {
    healthy: AtomicUsize,
    unhealthy: AtomicUsize,
    last_check: Mutex<Option<DateTime<Utc>>>,
}

impl HealthState {
    pub fn healthy_count(&self) -> usize {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn unhealthy_count(&self) -> usize {
        self.unhealthy.load(Ordering::Relaxed)
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        *self.last_check.lock()
    }

    pub fn overall(&self) -> OverallHealth {
        OverallHealth::from_counts(self.healthy_count(), self.unhealthy_count())
    }

    fn record(&self, report: &CycleReport) {
        self.healthy.store(report.healthy, Ordering::Relaxed);
        self.unhealthy.store(report.unhealthy, Ordering::Relaxed);
        *self.last_check.lock() = Some(Utc::now());
    }
}

/// Outcome of one probe cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub healthy: usize,
    pub unhealthy: usize,
    pub replaced: usize,
    pub removed: usize,
}

pub struct HealthMonitor {
    pool: Arc<SessionPool>,
    state: Arc<HealthState>,
    interval: Duration,
    probe_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<SessionPool>,
        interval: Duration,
        probe_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            state: Arc::new(HealthState::default()),
            interval,
            probe_timeout,
            metrics,
        }
    }

    pub fn state(&self) -> Arc<HealthState> {
        self.state.clone()
    }

    /// Run the monitor until `shutdown` fires. The first cycle runs one
    /// interval after start.
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "Health monitor started (interval {}s, probe timeout {}s)",
                self.interval.as_secs(),
                self.probe_timeout.as_secs()
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    _ = shutdown.recv() => {
                        info!("Health monitor stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Probe every idle session once and heal the failures.
    pub async fn run_once(&self) -> CycleReport {
        let snapshot = self.pool.snapshot();
        let probe_timeout = self.probe_timeout;

        let probes = snapshot.into_iter().map(|(index, session)| async move {
            let healthy = match tokio::time::timeout(probe_timeout, session.probe(PROBE_SCRIPT)).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    warn!(session_id = session.id(), "Health probe failed: {}", e);
                    false
                }
                Err(_) => {
                    warn!(session_id = session.id(), "Health probe timed out");
                    false
                }
            };
            (index, session, healthy)
        });
        let results = join_all(probes).await;

        let mut report = CycleReport::default();
        for (index, session, healthy) in results {
            if healthy {
                report.healthy += 1;
                continue;
            }
            report.unhealthy += 1;

            match self.pool.create_session().await {
                Ok(replacement) => {
                    let new_id = replacement.id();
                    let outcome = self.pool.replace(index, session.id(), replacement);
                    if outcome != ReplaceOutcome::Discarded {
                        report.replaced += 1;
                    }
                    info!(
                        old_session = session.id(),
                        new_session = new_id,
                        ?outcome,
                        "Replaced unhealthy session"
                    );
                }
                Err(e) => {
                    warn!(
                        session_id = session.id(),
                        "Failed to create replacement session: {}", e
                    );
                    if self.pool.remove(session.id()) {
                        report.removed += 1;
                    }
                }
            }
        }

        self.state.record(&report);
        self.metrics.set_health(report.healthy, report.unhealthy);
        self.metrics.set_pool_size(self.pool.size());
        debug!(
            healthy = report.healthy,
            unhealthy = report.unhealthy,
            pool_size = self.pool.size(),
            "Health check cycle complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::MockEngine;

    async fn setup(engine: &MockEngine, idle: usize) -> (Arc<SessionPool>, Arc<HealthMonitor>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = Arc::new(SessionPool::new(
            Arc::new(engine.clone()),
            idle.max(1),
            metrics.clone(),
        ));
        let mut held = Vec::new();
        for _ in 0..idle {
            held.push(pool.acquire().await.unwrap());
        }
        drop(held);
        let monitor = Arc::new(HealthMonitor::new(
            pool.clone(),
            Duration::from_secs(30),
            Duration::from_secs(5),
            metrics,
        ));
        (pool, monitor)
    }

    #[test]
    fn test_overall_health_from_counts() {
        assert_eq!(OverallHealth::from_counts(0, 0), OverallHealth::Healthy);
        assert_eq!(OverallHealth::from_counts(3, 0), OverallHealth::Healthy);
        assert_eq!(OverallHealth::from_counts(2, 1), OverallHealth::Degraded);
        assert_eq!(OverallHealth::from_counts(0, 2), OverallHealth::Unhealthy);
    }

    #[tokio::test]
    async fn test_all_healthy() {
        let engine = MockEngine::new();
        let (pool, monitor) = setup(&engine, 3).await;

        let report = monitor.run_once().await;
        assert_eq!(report.healthy, 3);
        assert_eq!(report.unhealthy, 0);
        assert_eq!(pool.size(), 3);
        assert_eq!(monitor.state().overall(), OverallHealth::Healthy);
        assert!(monitor.state().last_check().is_some());
    }

    #[tokio::test]
    async fn test_unhealthy_session_replaced() {
        let engine = MockEngine::new();
        let (pool, monitor) = setup(&engine, 2).await;
        let sick = pool.snapshot()[1].1.id();
        engine.mark_unhealthy(sick);

        let report = monitor.run_once().await;
        assert_eq!(report.healthy, 1);
        assert_eq!(report.unhealthy, 1);
        assert_eq!(report.replaced, 1);
        assert_eq!(pool.size(), 2);
        assert!(pool.snapshot().iter().all(|(_, s)| s.id() != sick));
        assert_eq!(monitor.state().overall(), OverallHealth::Degraded);
    }

    #[tokio::test]
    async fn test_dead_session_replaced() {
        let engine = MockEngine::new();
        let (pool, monitor) = setup(&engine, 1).await;
        engine.sessions()[0].kill();

        let report = monitor.run_once().await;
        assert_eq!(report.unhealthy, 1);
        assert_eq!(pool.size(), 1);
        assert!(pool.snapshot()[0].1.is_alive());
        assert_eq!(monitor.state().overall(), OverallHealth::Unhealthy);
    }

    #[tokio::test]
    async fn test_replacement_failure_removes_slot() {
        let engine = MockEngine::new();
        let (pool, monitor) = setup(&engine, 2).await;
        let sick = pool.snapshot()[0].1.id();
        engine.mark_unhealthy(sick);
        engine.set_fail_create(true);

        let report = monitor.run_once().await;
        assert_eq!(report.replaced, 0);
        assert_eq!(report.removed, 1);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_empty_pool_is_healthy() {
        let engine = MockEngine::new();
        let (_pool, monitor) = setup(&engine, 0).await;

        let report = monitor.run_once().await;
        assert_eq!(report, CycleReport::default());
        assert_eq!(monitor.state().overall(), OverallHealth::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_runs_on_interval_and_stops() {
        let engine = MockEngine::new();
        let (_pool, monitor) = setup(&engine, 1).await;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = monitor.clone().spawn(shutdown_rx);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(engine.probes(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(engine.probes(), 2);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
