//! Chrome DevTools protocol engine.
//!
//! Each session owns one browser process. The CDP handler stream is driven on
//! its own task; when it ends the browser is gone and the session reports
//! itself dead.

use super::{
    next_session_id, CookieParam, EngineError, HeaderInjector, LoadMilestone, RenderSession,
    SessionCookie, SessionFactory, SessionId,
};
use crate::config::EngineConfig;
use async_trait::async_trait;
use chrono::DateTime;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetScriptExecutionDisabledParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams as FetchEnableParams, EventRequestPaused, HeaderEntry,
    RequestPattern,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ClearBrowserCookiesParams, CookieParam as CdpCookieParam, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const BLANK_PAGE: &str = "about:blank";
const IDLE_POLL: Duration = Duration::from_millis(250);
const READY_STATE_SCRIPT: &str = "document.readyState";
const RESOURCE_COUNT_SCRIPT: &str = "performance.getEntriesByType('resource').length";

fn engine_error(err: CdpError) -> EngineError {
    EngineError::from_message(err.to_string())
}

/// Launches one Chromium process per session.
pub struct ChromiumFactory {
    config: EngineConfig,
}

impl ChromiumFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn browser_config(&self) -> Result<BrowserConfig, EngineError> {
        let mut builder = BrowserConfig::builder();
        if !self.config.headless {
            builder = builder.with_head();
        }
        if self.config.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(executable) = &self.config.executable {
            builder = builder.chrome_executable(executable);
        }
        builder = builder
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .args(self.config.args.iter().map(String::as_str));
        builder.build().map_err(EngineError::Launch)
    }
}

#[async_trait]
impl SessionFactory for ChromiumFactory {
    async fn create(&self) -> Result<Arc<dyn RenderSession>, EngineError> {
        let (browser, mut handler) = Browser::launch(self.browser_config()?)
            .await
            .map_err(|e| EngineError::Launch(e.to_string()))?;

        let id = next_session_id();
        let alive = Arc::new(AtomicBool::new(true));
        let handler_alive = alive.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(session_id = id, "CDP handler error: {}", e);
                }
            }
            handler_alive.store(false, Ordering::SeqCst);
            debug!(session_id = id, "CDP handler finished");
        });

        debug!(session_id = id, "Launched browser session");
        Ok(Arc::new(ChromiumSession {
            id,
            created_at: Instant::now(),
            browser: Mutex::new(browser),
            page: Mutex::new(None),
            alive,
            handler_task,
            interceptor: parking_lot::Mutex::new(None),
        }))
    }

    fn name(&self) -> &str {
        "chromium"
    }
}

pub struct ChromiumSession {
    id: SessionId,
    created_at: Instant,
    browser: Mutex<Browser>,
    page: Mutex<Option<Page>>,
    alive: Arc<AtomicBool>,
    handler_task: JoinHandle<()>,
    interceptor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ChromiumSession {
    fn check_alive(&self) -> Result<(), EngineError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Closed)
        }
    }

    async fn page(&self) -> Result<Page, EngineError> {
        self.check_alive()?;
        self.page
            .lock()
            .await
            .clone()
            .ok_or_else(|| EngineError::Page("no working page".to_string()))
    }

    fn stop_interceptor(&self) {
        if let Some(task) = self.interceptor.lock().take() {
            task.abort();
        }
    }
}

async fn evaluate_on(page: &Page, source: &str) -> Result<Value, EngineError> {
    let params = EvaluateParams::builder()
        .expression(source)
        .await_promise(true)
        .return_by_value(true)
        .build()
        .map_err(EngineError::Script)?;
    let result = page
        .evaluate_expression(params)
        .await
        .map_err(|e| EngineError::Script(e.to_string()))?;
    Ok(result.value().cloned().unwrap_or(Value::Null))
}

#[async_trait]
impl RenderSession for ChromiumSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.handler_task.is_finished()
    }

    async fn open_page(&self) -> Result<(), EngineError> {
        self.check_alive()?;
        self.stop_interceptor();
        let page = self
            .browser
            .lock()
            .await
            .new_page(BLANK_PAGE)
            .await
            .map_err(|e| EngineError::Page(e.to_string()))?;
        let previous = self.page.lock().await.replace(page);
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                debug!(session_id = self.id, "Failed to close previous page: {}", e);
            }
        }
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str) -> Result<(), EngineError> {
        let page = self.page().await?;
        page.execute(SetUserAgentOverrideParams::new(user_agent))
            .await
            .map_err(engine_error)?;
        Ok(())
    }

    async fn set_script_enabled(&self, enabled: bool) -> Result<(), EngineError> {
        let page = self.page().await?;
        page.execute(SetScriptExecutionDisabledParams::new(!enabled))
            .await
            .map_err(engine_error)?;
        Ok(())
    }

    async fn set_cookies(&self, cookies: &[CookieParam]) -> Result<(), EngineError> {
        let page = self.page().await?;
        let params = cookies
            .iter()
            .map(|c| {
                let mut param = CdpCookieParam::new(c.name.clone(), c.value.clone());
                param.domain = c.domain.clone();
                param.path = c.path.clone();
                param
            })
            .collect::<Vec<_>>();
        page.set_cookies(params).await.map_err(engine_error)?;
        Ok(())
    }

    async fn get_cookies(&self) -> Result<Vec<SessionCookie>, EngineError> {
        let page = self.page().await?;
        let cookies = page.get_cookies().await.map_err(engine_error)?;
        Ok(cookies
            .into_iter()
            .map(|c| SessionCookie {
                expires_at: (!c.session && c.expires > 0.0)
                    .then(|| DateTime::from_timestamp(c.expires as i64, 0))
                    .flatten(),
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                secure: c.secure,
                http_only: c.http_only,
            })
            .collect())
    }

    async fn clear_cookies(&self) -> Result<(), EngineError> {
        let page = self.page().await?;
        page.execute(ClearBrowserCookiesParams::default())
            .await
            .map_err(engine_error)?;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), EngineError> {
        let page = self.page().await?;
        page.goto(url).await.map_err(engine_error)?;
        Ok(())
    }

    async fn wait_for_load(&self, milestone: LoadMilestone) -> Result<(), EngineError> {
        let page = self.page().await?;
        page.wait_for_navigation().await.map_err(engine_error)?;
        let wanted: &[&str] = match milestone {
            LoadMilestone::DomContentLoaded => &["interactive", "complete"],
            LoadMilestone::Load => &["complete"],
        };
        loop {
            let state = evaluate_on(&page, READY_STATE_SCRIPT).await?;
            if state.as_str().is_some_and(|s| wanted.contains(&s)) {
                return Ok(());
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    async fn wait_network_idle(&self, window: Duration) -> Result<(), EngineError> {
        let page = self.page().await?;
        let deadline = tokio::time::Instant::now() + window;
        let mut last = evaluate_on(&page, RESOURCE_COUNT_SCRIPT).await?;
        let mut quiet_polls = 0;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(IDLE_POLL).await;
            let current = evaluate_on(&page, RESOURCE_COUNT_SCRIPT).await?;
            if current == last {
                quiet_polls += 1;
                if quiet_polls >= 2 {
                    return Ok(());
                }
            } else {
                quiet_polls = 0;
                last = current;
            }
        }
        Err(EngineError::Timeout("network idle".to_string()))
    }

    async fn evaluate_script(&self, source: &str) -> Result<Value, EngineError> {
        let page = self.page().await?;
        evaluate_on(&page, source).await
    }

    async fn intercept_requests(&self, injector: HeaderInjector) -> Result<(), EngineError> {
        let page = self.page().await?;
        let mut paused = page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(engine_error)?;
        page.execute(
            FetchEnableParams::builder()
                .pattern(RequestPattern::builder().url_pattern("*").build())
                .build(),
        )
        .await
        .map_err(engine_error)?;

        let session_id = self.id;
        let listener_page = page.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let mut headers: Vec<(String, String)> = event
                    .request
                    .headers
                    .inner()
                    .as_object()
                    .map(|map| {
                        map.iter()
                            .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                injector.apply(&mut headers);

                let entries = headers
                    .into_iter()
                    .map(|(name, value)| HeaderEntry::new(name, value))
                    .collect::<Vec<_>>();
                let params = match ContinueRequestParams::builder()
                    .request_id(event.request_id.clone())
                    .headers(entries)
                    .build()
                {
                    Ok(params) => params,
                    Err(e) => {
                        warn!(session_id, "Failed to build continue request: {}", e);
                        continue;
                    }
                };
                if let Err(e) = listener_page.execute(params).await {
                    debug!(session_id, "Failed to continue intercepted request: {}", e);
                }
            }
        });
        if let Some(previous) = self.interceptor.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn document_html(&self) -> Result<String, EngineError> {
        let page = self.page().await?;
        page.content().await.map_err(engine_error)
    }

    async fn release_page(&self) -> Result<(), EngineError> {
        self.stop_interceptor();
        let page = self.page.lock().await.take();
        if let Some(page) = page {
            page.close().await.map_err(engine_error)?;
        }
        Ok(())
    }

    async fn close_pages(&self) -> Result<(), EngineError> {
        self.stop_interceptor();
        self.page.lock().await.take();
        let pages = self
            .browser
            .lock()
            .await
            .pages()
            .await
            .map_err(engine_error)?;
        for page in pages {
            if let Err(e) = page.close().await {
                debug!(session_id = self.id, "Failed to close page: {}", e);
            }
        }
        Ok(())
    }

    async fn probe(&self, script: &str) -> Result<Value, EngineError> {
        self.check_alive()?;
        let page = self
            .browser
            .lock()
            .await
            .new_page(BLANK_PAGE)
            .await
            .map_err(|e| EngineError::Page(e.to_string()))?;
        let result = evaluate_on(&page, script).await;
        if let Err(e) = page.close().await {
            debug!(session_id = self.id, "Failed to close probe page: {}", e);
        }
        result
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.stop_interceptor();
        self.alive.store(false, Ordering::SeqCst);
        let mut browser = self.browser.lock().await;
        let closed = browser.close().await.map(|_| ());
        if let Err(e) = browser.wait().await {
            debug!(session_id = self.id, "Failed to reap browser process: {}", e);
        }
        self.handler_task.abort();
        closed.map_err(engine_error)
    }
}
