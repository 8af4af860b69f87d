//! Rendering session capability.
//!
//! The proxy never talks to a browser directly. It drives sessions through the
//! [`RenderSession`] trait and creates them through a [`SessionFactory`], so any
//! engine offering this capability set can back the pool:
//!
//! - `chromium` - Chrome DevTools protocol engine (feature `chromium`)
//! - `mock` - scriptable in-memory engine for tests (feature `test-utils`)

#[cfg(feature = "chromium")]
pub mod chromium;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::HeaderMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-unique identifier of a session.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next session id. Engines call this once per created session.
pub fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Document loading milestone reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMilestone {
    /// DOM parsed (`DOMContentLoaded`)
    DomContentLoaded,
    /// All subresources loaded (`load`)
    Load,
}

/// Cookie handed to a session before navigation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieParam {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
}

/// Cookie read back from a session after execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
}

/// Headers injected onto every outgoing sub-request of a navigation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderInjector {
    headers: Vec<(String, String)>,
}

impl HeaderInjector {
    pub fn new(headers: Vec<(String, String)>) -> Self {
        Self { headers }
    }

    /// Pick the allow-listed headers present on the inbound request.
    pub fn from_request(allow_list: &[String], inbound: &HeaderMap) -> Self {
        let headers = allow_list
            .iter()
            .filter_map(|name| {
                inbound
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| !v.is_empty())
                    .map(|v| (name.clone(), v.to_string()))
            })
            .collect();
        Self { headers }
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Set each injected header on an outgoing request, replacing any existing
    /// value with the same (case-insensitive) name.
    pub fn apply(&self, outgoing: &mut Vec<(String, String)>) {
        for (name, value) in &self.headers {
            outgoing.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
            outgoing.push((name.clone(), value.clone()));
        }
    }
}

/// Failure reported by a rendering engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("failed to launch session: {0}")]
    Launch(String),
    #[error("failed to open page: {0}")]
    Page(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("target closed")]
    TargetClosed,
    #[error("page crashed")]
    Crashed,
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("session closed")]
    Closed,
    #[error("{0}")]
    Protocol(String),
}

impl EngineError {
    /// Classify a raw engine message into a typed error.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("deadline exceeded") || lower.contains("timed out") || lower.contains("timeout") {
            EngineError::Timeout(message)
        } else if lower.contains("crashed") {
            EngineError::Crashed
        } else if lower.contains("target closed") {
            EngineError::TargetClosed
        } else if message.contains("net::ERR") {
            EngineError::Network(message)
        } else {
            EngineError::Protocol(message)
        }
    }

    /// Whether this failure means the session itself is no longer usable.
    pub fn is_crash(&self) -> bool {
        matches!(self, EngineError::Crashed | EngineError::Closed)
    }
}

/// One running rendering engine instance.
///
/// A checked-out session is used by exactly one request at a time. The health
/// monitor may call [`RenderSession::probe`] on a pooled session concurrently,
/// which runs in an auxiliary context and must not disturb the working page.
#[async_trait]
pub trait RenderSession: Send + Sync {
    fn id(&self) -> SessionId;

    fn created_at(&self) -> Instant;

    /// False once the engine has crashed or been closed.
    fn is_alive(&self) -> bool;

    /// Replace the working page with a fresh one.
    async fn open_page(&self) -> Result<(), EngineError>;

    async fn set_user_agent(&self, user_agent: &str) -> Result<(), EngineError>;

    async fn set_script_enabled(&self, enabled: bool) -> Result<(), EngineError>;

    async fn set_cookies(&self, cookies: &[CookieParam]) -> Result<(), EngineError>;

    async fn get_cookies(&self) -> Result<Vec<SessionCookie>, EngineError>;

    /// Drop every cookie the session holds.
    async fn clear_cookies(&self) -> Result<(), EngineError>;

    async fn navigate(&self, url: &str) -> Result<(), EngineError>;

    async fn wait_for_load(&self, milestone: LoadMilestone) -> Result<(), EngineError>;

    /// Best-effort wait for in-flight sub-requests to settle.
    async fn wait_network_idle(&self, window: Duration) -> Result<(), EngineError>;

    async fn evaluate_script(&self, source: &str) -> Result<Value, EngineError>;

    /// Intercept outgoing sub-requests of the working page.
    async fn intercept_requests(&self, injector: HeaderInjector) -> Result<(), EngineError>;

    async fn document_html(&self) -> Result<String, EngineError>;

    /// Close the working page and stop intercepting its sub-requests.
    async fn release_page(&self) -> Result<(), EngineError>;

    /// Close every page the session holds.
    async fn close_pages(&self) -> Result<(), EngineError>;

    /// Evaluate `script` in a throwaway auxiliary context.
    async fn probe(&self, script: &str) -> Result<Value, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Creates sessions for the pool.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn RenderSession>, EngineError>;

    /// Engine name for logs.
    fn name(&self) -> &str;
}
