//! Bounded pool of rendering sessions.
//!
//! Idle sessions sit in a LIFO stack behind one mutex. Sessions are created on
//! demand when the stack is empty and closed on a detached task when a release
//! would exceed `max_size`, so the lock is never held across engine I/O.
//!
//! `max_size` bounds idle sessions only. Under a burst, more sessions may be
//! checked out at once than `max_size`; the surplus is closed as each one is
//! returned.

pub mod health;

use crate::metrics::Metrics;
use crate::session::{EngineError, RenderSession, SessionFactory, SessionId};
use futures::future::join_all;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("session pool is shut down")]
    ShutDown,
    #[error("failed to create session: {0}")]
    Creation(#[from] EngineError),
    #[error("failed to close {failed} of {total} sessions: {}", errors.join("; "))]
    Shutdown {
        failed: usize,
        total: usize,
        errors: Vec<String>,
    },
}

/// What [`SessionPool::replace`] did with the replacement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The old session was found and swapped out.
    Swapped,
    /// The old session was no longer pooled; the replacement filled free room.
    Pooled,
    /// No room for the replacement; it was closed.
    Discarded,
}

struct PoolState {
    sessions: Vec<Arc<dyn RenderSession>>,
    shut_down: bool,
}

pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    max_size: usize,
    state: Mutex<PoolState>,
    metrics: Arc<Metrics>,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, max_size: usize, metrics: Arc<Metrics>) -> Self {
        debug!(
            "Creating session pool: engine={}, max_size={}",
            factory.name(),
            max_size
        );
        Self {
            factory,
            max_size,
            state: Mutex::new(PoolState {
                sessions: Vec::with_capacity(max_size),
                shut_down: false,
            }),
            metrics,
        }
    }

    /// Check out the most recently returned session, creating one if none is idle.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledSession, PoolError> {
        loop {
            let popped = {
                let mut state = self.state.lock();
                if state.shut_down {
                    return Err(PoolError::ShutDown);
                }
                let popped = state.sessions.pop();
                self.metrics.set_pool_size(state.sessions.len());
                popped
            };

            match popped {
                Some(session) if session.is_alive() => {
                    return Ok(PooledSession::new(session, self.clone()));
                }
                Some(dead) => {
                    debug!(session_id = dead.id(), "Dropping dead idle session");
                    self.spawn_close(dead);
                }
                None => break,
            }
        }

        let session = self.create_session().await?;
        Ok(PooledSession::new(session, self.clone()))
    }

    /// Create a session through the factory without pooling it.
    pub async fn create_session(&self) -> Result<Arc<dyn RenderSession>, PoolError> {
        let session = self.factory.create().await?;
        self.metrics.record_session_created();
        debug!(session_id = session.id(), engine = self.factory.name(), "Session created");
        Ok(session)
    }

    /// Return a session. Surplus, dead or post-shutdown sessions are closed.
    pub fn release(&self, session: Arc<dyn RenderSession>) {
        let rejected = {
            let mut state = self.state.lock();
            if state.shut_down || !session.is_alive() || state.sessions.len() >= self.max_size {
                Some(session)
            } else {
                state.sessions.push(session);
                self.metrics.set_pool_size(state.sessions.len());
                None
            }
        };

        if let Some(session) = rejected {
            debug!(session_id = session.id(), "Closing surplus session");
            self.spawn_close(session);
        }
    }

    /// Close a session on a detached task.
    pub fn spawn_close(&self, session: Arc<dyn RenderSession>) {
        let metrics = self.metrics.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = session.close().await {
                        warn!(session_id = session.id(), "Failed to close session: {}", e);
                    }
                    metrics.record_session_closed();
                });
            }
            Err(_) => {
                warn!(
                    session_id = session.id(),
                    "No runtime available, dropping session without close"
                );
            }
        }
    }

    /// Swap the pooled session `expected_id` (normally at `index`) for
    /// `replacement`, closing the old one.
    pub fn replace(
        &self,
        index: usize,
        expected_id: SessionId,
        replacement: Arc<dyn RenderSession>,
    ) -> ReplaceOutcome {
        let (outcome, to_close) = {
            let mut state = self.state.lock();
            if state.shut_down {
                (ReplaceOutcome::Discarded, Some(replacement))
            } else {
                let slot = match state.sessions.get(index) {
                    Some(s) if s.id() == expected_id => Some(index),
                    _ => state.sessions.iter().position(|s| s.id() == expected_id),
                };
                match slot {
                    Some(slot) => {
                        let old = std::mem::replace(&mut state.sessions[slot], replacement);
                        (ReplaceOutcome::Swapped, Some(old))
                    }
                    None if state.sessions.len() < self.max_size => {
                        state.sessions.push(replacement);
                        (ReplaceOutcome::Pooled, None)
                    }
                    None => (ReplaceOutcome::Discarded, Some(replacement)),
                }
            }
        };

        if let Some(session) = to_close {
            self.spawn_close(session);
        }
        self.metrics.set_pool_size(self.size());
        outcome
    }

    /// Remove and close the pooled session `id`. Returns whether it was pooled.
    pub fn remove(&self, id: SessionId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            state
                .sessions
                .iter()
                .position(|s| s.id() == id)
                .map(|pos| state.sessions.remove(pos))
        };
        match removed {
            Some(session) => {
                self.spawn_close(session);
                self.metrics.set_pool_size(self.size());
                true
            }
            None => false,
        }
    }

    /// Idle sessions with their current stack positions.
    pub fn snapshot(&self) -> Vec<(usize, Arc<dyn RenderSession>)> {
        self.state
            .lock()
            .sessions
            .iter()
            .cloned()
            .enumerate()
            .collect()
    }

    pub fn size(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Pre-create one session so the first request skips the cold start.
    pub async fn warm_up(&self) {
        match self.create_session().await {
            Ok(session) => {
                info!(session_id = session.id(), "Session pool warmed up");
                self.release(session);
            }
            Err(e) => warn!("Failed to warm up session pool: {}", e),
        }
    }

    /// Close every idle session and refuse further acquires.
    ///
    /// All sessions are closed even if some fail; the failures are reported
    /// together. Calling this again is a no-op.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let sessions = {
            let mut state = self.state.lock();
            state.shut_down = true;
            std::mem::take(&mut state.sessions)
        };
        self.metrics.set_pool_size(0);

        let total = sessions.len();
        if total == 0 {
            return Ok(());
        }
        info!("Shutting down session pool ({} sessions)", total);

        let results = join_all(sessions.iter().map(|s| s.close())).await;
        let errors: Vec<String> = results
            .into_iter()
            .zip(&sessions)
            .filter_map(|(result, session)| {
                self.metrics.record_session_closed();
                result.err().map(|e| format!("session {}: {}", session.id(), e))
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PoolError::Shutdown {
                failed: errors.len(),
                total,
                errors,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardState {
    Release,
    Discard,
    Detached,
}

/// A checked-out session. Returns to the pool exactly once when dropped.
pub struct PooledSession {
    session: Arc<dyn RenderSession>,
    pool: Arc<SessionPool>,
    state: GuardState,
}

impl PooledSession {
    fn new(session: Arc<dyn RenderSession>, pool: Arc<SessionPool>) -> Self {
        Self {
            session,
            pool,
            state: GuardState::Release,
        }
    }

    /// Close the session on drop instead of pooling it.
    pub fn discard(&mut self) {
        if self.state == GuardState::Release {
            self.state = GuardState::Discard;
        }
    }

    /// Take the session out of the guard; the caller becomes responsible for
    /// returning or closing it.
    pub fn detach(mut self) -> Arc<dyn RenderSession> {
        self.state = GuardState::Detached;
        self.session.clone()
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }
}

impl Deref for PooledSession {
    type Target = dyn RenderSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        match self.state {
            GuardState::Release => self.pool.release(self.session.clone()),
            GuardState::Discard => self.pool.spawn_close(self.session.clone()),
            GuardState::Detached => {}
        }
    }
}
