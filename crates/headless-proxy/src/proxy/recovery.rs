//! Crash recovery for sessions that failed mid-request.
//!
//! Recovery never blocks the failing request. It runs on a detached task that
//! closes every page of the session, then verifies trivial script execution in
//! a throwaway context. A recovered session goes back to the pool; one that
//! fails recovery is closed.

use crate::pool::SessionPool;
use crate::session::{EngineError, RenderSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const RECOVERY_SCRIPT: &str = "1+1";

/// Try to bring a crashed session back to a usable state.
pub async fn recover_session(
    session: &dyn RenderSession,
    probe_timeout: Duration,
) -> Result<(), EngineError> {
    session.close_pages().await?;
    match tokio::time::timeout(probe_timeout, session.probe(RECOVERY_SCRIPT)).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => Err(EngineError::Timeout("recovery probe".to_string())),
    }
}

/// Recover `session` on a detached task, then release or close it.
pub fn spawn_recovery(
    pool: Arc<SessionPool>,
    session: Arc<dyn RenderSession>,
    probe_timeout: Duration,
    request_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match recover_session(session.as_ref(), probe_timeout).await {
            Ok(()) if session.is_alive() => {
                info!(
                    request_id = %request_id,
                    session_id = session.id(),
                    "Recovered session after crash"
                );
                pool.release(session);
            }
            Ok(()) => {
                warn!(
                    request_id = %request_id,
                    session_id = session.id(),
                    "Session recovered but reports itself dead, closing"
                );
                pool.spawn_close(session);
            }
            Err(e) => {
                warn!(
                    request_id = %request_id,
                    session_id = session.id(),
                    "Failed to recover session: {}", e
                );
                pool.spawn_close(session);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::session::mock::MockEngine;
    use crate::session::SessionFactory;

    fn pool(engine: &MockEngine) -> Arc<SessionPool> {
        Arc::new(SessionPool::new(
            Arc::new(engine.clone()),
            2,
            Arc::new(Metrics::new().unwrap()),
        ))
    }

    #[tokio::test]
    async fn test_recover_live_session() {
        let engine = MockEngine::new();
        let session = engine.create().await.unwrap();

        recover_session(session.as_ref(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(engine.pages_closed(), 1);
        assert_eq!(engine.probes(), 1);
    }

    #[tokio::test]
    async fn test_recovered_session_returns_to_pool() {
        let engine = MockEngine::new();
        let pool = pool(&engine);
        let session = engine.create().await.unwrap();

        spawn_recovery(pool.clone(), session, Duration::from_secs(5), "r-1".into())
            .await
            .unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_dead_session_closed_after_failed_recovery() {
        let engine = MockEngine::new();
        let pool = pool(&engine);
        let session = engine.create().await.unwrap();
        engine.sessions()[0].kill();

        spawn_recovery(pool.clone(), session, Duration::from_secs(5), "r-2".into())
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(pool.size(), 0);
        assert_eq!(engine.pages_closed(), 1);
    }
}
