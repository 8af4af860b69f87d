//! Scriptable in-memory engine.
//!
//! Every session created by one [`MockEngine`] shares the engine's state, so a
//! test can change the served document, queue script results or inject
//! failures, then assert on what the sessions were asked to do. Cookies are the
//! exception: each session keeps its own jar, as a browser process would.

use super::{
    next_session_id, CookieParam, EngineError, HeaderInjector, LoadMilestone, RenderSession,
    SessionCookie, SessionFactory, SessionId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct MockState {
    page_html: Mutex<String>,
    navigated_urls: Mutex<Vec<String>>,
    navigation_error: Mutex<Option<EngineError>>,
    navigation_delay: Mutex<Option<Duration>>,
    open_page_error: Mutex<Option<EngineError>>,
    script_responses: Mutex<VecDeque<Result<Value, EngineError>>>,
    scripts: Mutex<Vec<String>>,
    unhealthy: Mutex<HashSet<SessionId>>,
    upstream_cookies: Mutex<Vec<SessionCookie>>,
    received_cookies: Mutex<Vec<CookieParam>>,
    rejected_cookie: Mutex<Option<String>>,
    injectors: Mutex<Vec<HeaderInjector>>,
    user_agents: Mutex<Vec<String>>,
    script_enabled: Mutex<Option<bool>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    fail_create: AtomicBool,
    created: AtomicUsize,
    closed: AtomicUsize,
    pages_opened: AtomicUsize,
    pages_closed: AtomicUsize,
    pages_released: AtomicUsize,
    cookie_clears: AtomicUsize,
    probes: AtomicUsize,
}

/// Factory handing out [`MockSession`]s.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose documents render as `html`.
    pub fn serving(html: &str) -> Self {
        let engine = Self::new();
        engine.set_page_html(html);
        engine
    }

    pub fn set_page_html(&self, html: &str) {
        *self.state.page_html.lock() = html.to_string();
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_navigation(&self, error: Option<EngineError>) {
        *self.state.navigation_error.lock() = error;
    }

    pub fn fail_open_page(&self, error: Option<EngineError>) {
        *self.state.open_page_error.lock() = error;
    }

    pub fn set_navigation_delay(&self, delay: Option<Duration>) {
        *self.state.navigation_delay.lock() = delay;
    }

    /// Queue the result of the next `evaluate_script` call. Unqueued calls
    /// evaluate to `null`.
    pub fn push_script_result(&self, result: Result<Value, EngineError>) {
        self.state.script_responses.lock().push_back(result);
    }

    /// Make probes of `id` fail.
    pub fn mark_unhealthy(&self, id: SessionId) {
        self.state.unhealthy.lock().insert(id);
    }

    /// Cookies the upstream sets on every navigation and fetch.
    pub fn set_upstream_cookies(&self, cookies: Vec<SessionCookie>) {
        *self.state.upstream_cookies.lock() = cookies;
    }

    /// Make `set_cookies` fail for a cookie with this name.
    pub fn reject_cookie(&self, name: &str) {
        *self.state.rejected_cookie.lock() = Some(name.to_string());
    }

    pub fn navigations(&self) -> usize {
        self.state.navigated_urls.lock().len()
    }

    pub fn navigated_urls(&self) -> Vec<String> {
        self.state.navigated_urls.lock().clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.state.scripts.lock().clone()
    }

    pub fn received_cookies(&self) -> Vec<CookieParam> {
        self.state.received_cookies.lock().clone()
    }

    pub fn injectors(&self) -> Vec<HeaderInjector> {
        self.state.injectors.lock().clone()
    }

    pub fn user_agents(&self) -> Vec<String> {
        self.state.user_agents.lock().clone()
    }

    pub fn script_enabled(&self) -> Option<bool> {
        *self.state.script_enabled.lock()
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.state.sessions.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn pages_opened(&self) -> usize {
        self.state.pages_opened.load(Ordering::SeqCst)
    }

    pub fn pages_closed(&self) -> usize {
        self.state.pages_closed.load(Ordering::SeqCst)
    }

    pub fn pages_released(&self) -> usize {
        self.state.pages_released.load(Ordering::SeqCst)
    }

    pub fn cookie_clears(&self) -> usize {
        self.state.cookie_clears.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for MockEngine {
    async fn create(&self) -> Result<Arc<dyn RenderSession>, EngineError> {
        if self.state.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::Launch("mock engine refused to launch".into()));
        }
        let session = Arc::new(MockSession {
            id: next_session_id(),
            created_at: Instant::now(),
            alive: AtomicBool::new(true),
            close_calls: AtomicUsize::new(0),
            jar: Mutex::new(Vec::new()),
            state: self.state.clone(),
        });
        self.state.created.fetch_add(1, Ordering::SeqCst);
        self.state.sessions.lock().push(session.clone());
        Ok(session)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Session backed by the shared [`MockEngine`] state.
pub struct MockSession {
    id: SessionId,
    created_at: Instant,
    alive: AtomicBool,
    close_calls: AtomicUsize,
    jar: Mutex<Vec<SessionCookie>>,
    state: Arc<MockState>,
}

impl MockSession {
    /// Simulate an engine crash.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn cookies(&self) -> Vec<SessionCookie> {
        self.jar.lock().clone()
    }

    fn store_cookie(&self, cookie: SessionCookie) {
        let mut jar = self.jar.lock();
        match jar.iter_mut().find(|c| c.name == cookie.name) {
            Some(existing) => *existing = cookie,
            None => jar.push(cookie),
        }
    }

    fn receive_upstream_cookies(&self) {
        let cookies = self.state.upstream_cookies.lock().clone();
        for cookie in cookies {
            self.store_cookie(cookie);
        }
    }

    fn check_alive(&self) -> Result<(), EngineError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Closed)
        }
    }
}

#[async_trait]
impl RenderSession for MockSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn open_page(&self) -> Result<(), EngineError> {
        self.check_alive()?;
        if let Some(err) = self.state.open_page_error.lock().clone() {
            return Err(err);
        }
        self.state.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str) -> Result<(), EngineError> {
        self.check_alive()?;
        self.state.user_agents.lock().push(user_agent.to_string());
        Ok(())
    }

    async fn set_script_enabled(&self, enabled: bool) -> Result<(), EngineError> {
        self.check_alive()?;
        *self.state.script_enabled.lock() = Some(enabled);
        Ok(())
    }

    async fn set_cookies(&self, cookies: &[CookieParam]) -> Result<(), EngineError> {
        self.check_alive()?;
        if let Some(rejected) = self.state.rejected_cookie.lock().as_deref() {
            if cookies.iter().any(|c| c.name == rejected) {
                return Err(EngineError::Protocol(format!("invalid cookie {rejected}")));
            }
        }
        self.state.received_cookies.lock().extend_from_slice(cookies);
        for cookie in cookies {
            self.store_cookie(SessionCookie {
                name: cookie.name.clone(),
                value: cookie.value.clone(),
                domain: cookie.domain.clone().unwrap_or_default(),
                path: cookie.path.clone().unwrap_or_default(),
                ..Default::default()
            });
        }
        Ok(())
    }

    async fn get_cookies(&self) -> Result<Vec<SessionCookie>, EngineError> {
        self.check_alive()?;
        Ok(self.jar.lock().clone())
    }

    async fn clear_cookies(&self) -> Result<(), EngineError> {
        self.check_alive()?;
        self.jar.lock().clear();
        self.state.cookie_clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), EngineError> {
        self.check_alive()?;
        let delay = *self.state.navigation_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.state.navigation_error.lock().clone() {
            if err == EngineError::Crashed {
                self.kill();
            }
            return Err(err);
        }
        self.state.navigated_urls.lock().push(url.to_string());
        self.receive_upstream_cookies();
        Ok(())
    }

    async fn wait_for_load(&self, _milestone: LoadMilestone) -> Result<(), EngineError> {
        self.check_alive()
    }

    async fn wait_network_idle(&self, _window: Duration) -> Result<(), EngineError> {
        self.check_alive()
    }

    async fn evaluate_script(&self, source: &str) -> Result<Value, EngineError> {
        self.check_alive()?;
        self.state.scripts.lock().push(source.to_string());
        self.receive_upstream_cookies();
        self.state
            .script_responses
            .lock()
            .pop_front()
            .unwrap_or(Ok(Value::Null))
    }

    async fn intercept_requests(&self, injector: HeaderInjector) -> Result<(), EngineError> {
        self.check_alive()?;
        self.state.injectors.lock().push(injector);
        Ok(())
    }

    async fn document_html(&self) -> Result<String, EngineError> {
        self.check_alive()?;
        Ok(self.state.page_html.lock().clone())
    }

    async fn release_page(&self) -> Result<(), EngineError> {
        self.check_alive()?;
        self.state.pages_released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close_pages(&self) -> Result<(), EngineError> {
        self.state.pages_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self, _script: &str) -> Result<Value, EngineError> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        self.check_alive()?;
        if self.state.unhealthy.lock().contains(&self.id) {
            return Err(EngineError::Script("probe failed".into()));
        }
        Ok(Value::from(2))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
