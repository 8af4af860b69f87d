//! Per-request orchestration.
//!
//! A request moves through cache check, session acquisition, page setup,
//! method-specific execution, cookie sync and cache store. One deadline covers
//! everything from page setup to extraction. The checked-out session is held
//! by a [`PooledSession`] guard, so it is returned to the pool however the
//! request ends, including cancellation by the deadline. Its working page is
//! closed before it goes back.
//!
//! Identical cacheable renders are coalesced: while one is in flight, the
//! others wait for it and are then answered from the cache.

use super::cookies::{format_set_cookie, request_cookie_params};
use super::fetch::{build_fetch_script, parse_fetch_result, FetchOutcome, UPSTREAM_ERROR_BODY};
use super::flight::RenderFlights;
use super::headers::{append_raw, ProxyHeadersExt, VALUE_HIT, VALUE_HTML, VALUE_TEXT, X_CACHE};
use super::recovery::spawn_recovery;
use super::request::{RenderRequest, RenderResponse};
use crate::cache::ResponseCache;
use crate::config::ProxySettings;
use crate::error::{ErrorKind, ProxyError, Stage};
use crate::metrics::Metrics;
use crate::optimizer::{ContentOptimizer, OptimizeOptions};
use crate::pool::{PooledSession, SessionPool};
use crate::session::{HeaderInjector, LoadMilestone, RenderSession};
use hyper::header::{HeaderMap, CONTENT_TYPE, SET_COOKIE};
use hyper::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

/// Best-effort wait for network quiescence after the DOM is ready.
const NETWORK_IDLE_WINDOW: Duration = Duration::from_secs(2);

/// How a request method is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodClass {
    /// GET: navigate and return the rendered document.
    Render,
    /// POST, PUT, DELETE, PATCH: replay through a script-level fetch.
    Fetch,
    Unsupported,
}

impl MethodClass {
    pub fn of(method: &Method) -> Self {
        match *method {
            Method::GET => MethodClass::Render,
            Method::POST | Method::PUT | Method::DELETE | Method::PATCH => MethodClass::Fetch,
            _ => MethodClass::Unsupported,
        }
    }
}

/// Join the upstream base and a request path, with exactly one `/` between.
pub fn compose_target_url(upstream: &str, path: &str, query: Option<&str>) -> String {
    let mut url = String::with_capacity(upstream.len() + path.len() + 16);
    url.push_str(upstream);
    match (upstream.ends_with('/'), path.starts_with('/')) {
        (false, false) if !path.is_empty() => url.push('/'),
        (true, true) => {
            url.pop();
        }
        _ => {}
    }
    url.push_str(path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

pub struct RenderPipeline {
    settings: ProxySettings,
    upstream_host: String,
    pool: Arc<SessionPool>,
    cache: Arc<ResponseCache>,
    optimizer: ContentOptimizer,
    flights: RenderFlights,
    metrics: Arc<Metrics>,
    recovery_timeout: Duration,
}

impl RenderPipeline {
    pub fn new(
        settings: ProxySettings,
        pool: Arc<SessionPool>,
        cache: Arc<ResponseCache>,
        metrics: Arc<Metrics>,
        recovery_timeout: Duration,
    ) -> Result<Self, url::ParseError> {
        let upstream_host = Url::parse(&settings.upstream)?
            .host_str()
            .unwrap_or_default()
            .to_string();
        let optimizer = ContentOptimizer::new(
            OptimizeOptions {
                compress_images: settings.compress_images,
                minify_content: settings.minify_content,
            },
            metrics.clone(),
        );
        Ok(Self {
            settings,
            upstream_host,
            pool,
            cache,
            optimizer,
            flights: RenderFlights::new(),
            metrics,
            recovery_timeout,
        })
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn target_url(&self, req: &RenderRequest) -> String {
        compose_target_url(&self.settings.upstream, &req.path, req.query.as_deref())
    }

    /// Serve one request. At most one attempt is made against the pool.
    pub async fn handle(&self, req: &RenderRequest) -> Result<RenderResponse, ProxyError> {
        let class = MethodClass::of(&req.method);
        if class == MethodClass::Unsupported {
            debug!(request_id = %req.request_id, method = %req.method, "Method not allowed");
            return Ok(method_not_allowed());
        }

        let _flight = match class {
            MethodClass::Render if self.cache.is_enabled() => {
                self.flights
                    .enter(self.cache.fingerprint(req), self.settings.timeout())
                    .await
            }
            _ => None,
        };

        if class == MethodClass::Render && self.cache.is_enabled() {
            if let Some(hit) = self.cache.lookup(req) {
                self.metrics.record_cache_hit();
                info!(
                    request_id = %req.request_id,
                    path = %req.path,
                    status = hit.status,
                    "Serving cached response"
                );
                let mut response = RenderResponse::new(hit.status, hit.headers, hit.body);
                response.headers.set_header(&X_CACHE, &VALUE_HIT);
                response.from_cache = true;
                return Ok(response);
            }
            self.metrics.record_cache_miss();
        }

        match self.execute(req, class).await {
            Ok(response) => Ok(response),
            Err(err) => {
                self.metrics.record_error(err.kind.as_str());
                error!(
                    request_id = %req.request_id,
                    method = %req.method,
                    url = %self.target_url(req),
                    error_kind = %err.kind,
                    "Request failed: {}", err.message
                );
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        req: &RenderRequest,
        class: MethodClass,
    ) -> Result<RenderResponse, ProxyError> {
        let mut session = self.pool.acquire().await?;
        let url = self.target_url(req);
        info!(request_id = %req.request_id, method = %req.method, url = %url, "Proxying request");

        let started = Instant::now();
        let timeout = self.settings.timeout();
        let outcome = tokio::time::timeout(timeout, self.drive(&session, req, class, &url)).await;
        self.metrics.record_render_time(started.elapsed());

        let result = outcome.unwrap_or_else(|_| Err(ProxyError::timeout(timeout)));
        if matches!(&result, Err(err) if err.crashed) {
            self.hand_off_crashed(session, req);
            return result;
        }
        self.release_page(&mut session, req).await;
        let response = result?;

        if class == MethodClass::Render {
            self.cache
                .store(req, &response.body, &response.headers, response.status);
        }
        drop(session);

        info!(
            request_id = %req.request_id,
            status = response.status,
            content_length = response.body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );
        Ok(response)
    }

    /// Close the working page so nothing of this request keeps running while
    /// the session sits idle. A session whose page cannot be closed is not
    /// pooled again.
    async fn release_page(&self, session: &mut PooledSession, req: &RenderRequest) {
        let failure = match tokio::time::timeout(self.recovery_timeout, session.release_page()).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };
        warn!(
            request_id = %req.request_id,
            session_id = session.id(),
            "Failed to close working page, discarding session: {}", failure
        );
        session.discard();
    }

    fn hand_off_crashed(&self, session: PooledSession, req: &RenderRequest) {
        warn!(
            request_id = %req.request_id,
            session_id = session.id(),
            "Session crashed, attempting recovery"
        );
        let pool = session.pool().clone();
        spawn_recovery(
            pool,
            session.detach(),
            self.recovery_timeout,
            req.request_id.clone(),
        );
    }

    async fn drive(
        &self,
        session: &PooledSession,
        req: &RenderRequest,
        class: MethodClass,
        url: &str,
    ) -> Result<RenderResponse, ProxyError> {
        let session: &dyn RenderSession = &**session;
        self.configure(session, req).await?;

        let mut response = match class {
            MethodClass::Render => self.render(session, req, url).await?,
            MethodClass::Fetch => self.fetch(session, req, url).await?,
            MethodClass::Unsupported => {
                return Err(ProxyError::internal("unsupported method reached the engine"))
            }
        };

        if self.settings.forward_cookies {
            self.sync_cookies(session, req, &mut response.headers).await;
        }
        Ok(response)
    }

    async fn configure(&self, session: &dyn RenderSession, req: &RenderRequest) -> Result<(), ProxyError> {
        session
            .open_page()
            .await
            .map_err(|e| ProxyError::from_engine(Stage::OpenPage, &e))?;
        session
            .clear_cookies()
            .await
            .map_err(|e| ProxyError::from_engine(Stage::Configure, &e))?;
        session
            .set_user_agent(&self.settings.user_agent)
            .await
            .map_err(|e| ProxyError::from_engine(Stage::Configure, &e))?;
        if !self.settings.enable_js {
            session
                .set_script_enabled(false)
                .await
                .map_err(|e| ProxyError::from_engine(Stage::Configure, &e))?;
        }

        if self.settings.forward_cookies {
            for cookie in request_cookie_params(&req.cookies, &self.upstream_host) {
                if let Err(e) = session.set_cookies(std::slice::from_ref(&cookie)).await {
                    warn!(
                        request_id = %req.request_id,
                        cookie = %cookie.name,
                        "Failed to set cookie: {}", e
                    );
                }
            }
        }
        Ok(())
    }

    async fn render(
        &self,
        session: &dyn RenderSession,
        req: &RenderRequest,
        url: &str,
    ) -> Result<RenderResponse, ProxyError> {
        let injector = HeaderInjector::from_request(&self.settings.forward_headers, &req.headers);
        if !injector.is_empty() {
            session
                .intercept_requests(injector)
                .await
                .map_err(|e| ProxyError::from_engine(Stage::Navigate, &e))?;
        }

        session
            .navigate(url)
            .await
            .map_err(|e| ProxyError::from_engine(Stage::Navigate, &e))?;
        session
            .wait_for_load(LoadMilestone::DomContentLoaded)
            .await
            .map_err(|e| ProxyError::from_engine(Stage::Navigate, &e))?;
        if let Err(e) = session.wait_network_idle(NETWORK_IDLE_WINDOW).await {
            warn!(request_id = %req.request_id, "Timeout waiting for network idle: {}", e);
        }

        let html = if self.settings.optimize_resources {
            self.optimizer
                .optimize_session(session)
                .await
                .map_err(|e| ProxyError::from_engine(Stage::Extract, &e))?
                .html
        } else {
            session
                .document_html()
                .await
                .map_err(|e| ProxyError::from_engine(Stage::Extract, &e))?
        };

        let mut headers = HeaderMap::new();
        headers.set_header(&CONTENT_TYPE, &VALUE_HTML);
        Ok(RenderResponse::new(200, headers, html))
    }

    async fn fetch(
        &self,
        session: &dyn RenderSession,
        req: &RenderRequest,
        url: &str,
    ) -> Result<RenderResponse, ProxyError> {
        let mut headers = Vec::new();
        if let Some(content_type) = req.header("content-type") {
            headers.push(("Content-Type".to_string(), content_type.to_string()));
        }
        HeaderInjector::from_request(&self.settings.forward_headers, &req.headers).apply(&mut headers);

        let script = build_fetch_script(url, req.method.as_str(), &headers, &req.body);
        let value = session
            .evaluate_script(&script)
            .await
            .map_err(|e| ProxyError::from_engine(Stage::Fetch, &e))?;
        let outcome = parse_fetch_result(&value)
            .map_err(|e| ProxyError::new(ErrorKind::ResponseProcessingFailed, e))?;

        match outcome {
            FetchOutcome::NetworkError(message) => {
                error!(request_id = %req.request_id, url, "Fetch API error: {}", message);
                let mut headers = HeaderMap::new();
                headers.set_header(&CONTENT_TYPE, &VALUE_TEXT);
                Ok(RenderResponse::new(502, headers, UPSTREAM_ERROR_BODY))
            }
            FetchOutcome::Response {
                status,
                headers: fetched,
                body,
            } => {
                let mut headers = HeaderMap::new();
                for (name, value) in &fetched {
                    if !append_raw(&mut headers, name, value) {
                        debug!(request_id = %req.request_id, header = %name, "Dropping invalid response header");
                    }
                }
                Ok(RenderResponse::new(status, headers, body))
            }
        }
    }

    async fn sync_cookies(&self, session: &dyn RenderSession, req: &RenderRequest, headers: &mut HeaderMap) {
        match session.get_cookies().await {
            Ok(cookies) => {
                for cookie in &cookies {
                    append_raw(headers, SET_COOKIE.as_str(), &format_set_cookie(cookie));
                }
            }
            Err(e) => warn!(request_id = %req.request_id, "Failed to read session cookies: {}", e),
        }
    }
}

fn method_not_allowed() -> RenderResponse {
    let mut headers = HeaderMap::new();
    headers.set_header(&CONTENT_TYPE, &VALUE_TEXT);
    RenderResponse::new(405, headers, "Method not allowed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::MockEngine;
    use crate::session::{EngineError, SessionCookie};
    use serde_json::json;
    use tracing_test::traced_test;

    struct Harness {
        engine: MockEngine,
        pipeline: RenderPipeline,
    }

    fn harness(engine: MockEngine, configure: impl FnOnce(&mut ProxySettings)) -> Harness {
        let mut settings = ProxySettings::new("http://upstream.test");
        configure(&mut settings);
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = Arc::new(SessionPool::new(
            Arc::new(engine.clone()),
            settings.max_browsers,
            metrics.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(
            settings.cache_ttl(),
            settings.forward_headers.clone(),
            settings.forward_cookies,
        ));
        let pipeline =
            RenderPipeline::new(settings, pool, cache, metrics, Duration::from_secs(5)).unwrap();
        Harness { engine, pipeline }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_method_classes() {
        assert_eq!(MethodClass::of(&Method::GET), MethodClass::Render);
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
            assert_eq!(MethodClass::of(&method), MethodClass::Fetch);
        }
        for method in [Method::HEAD, Method::OPTIONS, Method::TRACE, Method::CONNECT] {
            assert_eq!(MethodClass::of(&method), MethodClass::Unsupported);
        }
    }

    #[test]
    fn test_compose_target_url() {
        assert_eq!(compose_target_url("http://a.test", "/x", None), "http://a.test/x");
        assert_eq!(compose_target_url("http://a.test/", "x", None), "http://a.test/x");
        assert_eq!(compose_target_url("http://a.test", "x", None), "http://a.test/x");
        assert_eq!(compose_target_url("http://a.test/", "/x", None), "http://a.test/x");
        assert_eq!(
            compose_target_url("http://a.test/base", "/p", Some("q=1&r=2")),
            "http://a.test/base/p?q=1&r=2"
        );
        assert_eq!(compose_target_url("http://a.test", "/", Some("")), "http://a.test/");
    }

    #[tokio::test]
    async fn test_get_renders_document() {
        let h = harness(MockEngine::serving("<html><body>Hello</body></html>"), |_| {});
        let req = RenderRequest::new(Method::GET, "/page?x=1", "req-1");

        let response = h.pipeline.handle(&req).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("text/html; charset=utf-8"));
        assert_eq!(&response.body[..], b"<html><body>Hello</body></html>");
        assert!(!response.from_cache);
        assert_eq!(h.engine.navigated_urls(), vec!["http://upstream.test/page?x=1"]);
        assert_eq!(h.engine.user_agents(), vec![crate::config::DEFAULT_USER_AGENT]);
        assert_eq!(h.pipeline.pool().size(), 1);
    }

    #[tokio::test]
    async fn test_cached_get_skips_engine() {
        let h = harness(MockEngine::serving("Page 1"), |s| {
            s.cache_ttl = 60;
            s.max_browsers = 1;
        });
        let req = RenderRequest::new(Method::GET, "/cached", "req-1");

        let first = h.pipeline.handle(&req).await.unwrap();
        assert_eq!(&first.body[..], b"Page 1");

        h.engine.set_page_html("Page 2");
        let second = h.pipeline.handle(&req).await.unwrap();
        assert_eq!(&second.body[..], b"Page 1");
        assert!(second.from_cache);
        assert_eq!(second.header("x-cache"), Some("HIT"));
        assert_eq!(h.engine.navigations(), 1);
    }

    #[tokio::test]
    async fn test_cache_disabled_renders_every_time() {
        let h = harness(MockEngine::serving("Page 1"), |_| {});
        let req = RenderRequest::new(Method::GET, "/", "req-1");

        h.pipeline.handle(&req).await.unwrap();
        h.engine.set_page_html("Page 2");
        let second = h.pipeline.handle(&req).await.unwrap();
        assert_eq!(&second.body[..], b"Page 2");
        assert_eq!(h.engine.navigations(), 2);
    }

    #[tokio::test]
    async fn test_delete_uses_fetch() {
        let h = harness(MockEngine::new(), |s| s.cache_ttl = 60);
        h.engine.push_script_result(Ok(json!({
            "status": 202,
            "statusText": "Accepted",
            "headers": {"content-type": "application/json", "x-upstream": "yes"},
            "body": "{\"deleted\":true}"
        })));
        let req = RenderRequest::new(Method::DELETE, "/items/1", "req-1")
            .with_header("content-type", "application/json")
            .with_body(r#"{"x":1}"#);

        let response = h.pipeline.handle(&req).await.unwrap();
        assert_eq!(response.status, 202);
        assert_eq!(&response.body[..], b"{\"deleted\":true}");
        assert_eq!(response.header("x-upstream"), Some("yes"));
        assert_eq!(h.engine.navigations(), 0);

        let scripts = h.engine.scripts();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains(r#"fetch("http://upstream.test/items/1""#));
        assert!(scripts[0].contains(r#""method":"DELETE""#));
        assert!(scripts[0].contains(r#""body":"{\"x\":1}""#));
        assert!(scripts[0].contains(r#""Content-Type":"application/json""#));
        assert!(h.pipeline.cache().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_network_error_is_bad_gateway() {
        let h = harness(MockEngine::new(), |_| {});
        h.engine
            .push_script_result(Ok(json!({"error": "TypeError: Failed to fetch", "status": 500})));
        let req = RenderRequest::new(Method::POST, "/submit", "req-1");

        let response = h.pipeline.handle(&req).await.unwrap();
        assert_eq!(response.status, 502);
        assert_eq!(&response.body[..], UPSTREAM_ERROR_BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_malformed_fetch_result() {
        let h = harness(MockEngine::new(), |_| {});
        h.engine.push_script_result(Ok(json!("nonsense")));
        let req = RenderRequest::new(Method::PUT, "/x", "req-1");

        let err = h.pipeline.handle(&req).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResponseProcessingFailed);
        assert_eq!(err.status(), 502);
    }

    #[tokio::test]
    async fn test_unsupported_method_touches_nothing() {
        let h = harness(MockEngine::serving("x"), |s| s.cache_ttl = 60);
        let req = RenderRequest::new(Method::TRACE, "/", "req-1");

        let response = h.pipeline.handle(&req).await.unwrap();
        assert_eq!(response.status, 405);
        assert_eq!(&response.body[..], b"Method not allowed");
        assert_eq!(h.engine.created(), 0);
        assert_eq!(h.pipeline.cache().stats().misses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_produces_timeout() {
        let h = harness(MockEngine::serving("slow"), |s| s.timeout = 1);
        h.engine.set_navigation_delay(Some(Duration::from_secs(60)));
        let req = RenderRequest::new(Method::GET, "/slow", "req-1");

        let err = h.pipeline.handle(&req).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.status(), 504);
        assert_eq!(h.pipeline.pool().size(), 1);
    }

    #[tokio::test]
    async fn test_navigation_failure_releases_session() {
        let h = harness(MockEngine::serving("x"), |_| {});
        h.engine
            .fail_navigation(Some(EngineError::Navigation("net::ERR_NAME_NOT_RESOLVED".into())));
        let req = RenderRequest::new(Method::GET, "/", "req-1");

        let err = h.pipeline.handle(&req).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NavigationFailed);
        assert!(!err.crashed);
        assert_eq!(h.pipeline.pool().size(), 1);
        assert_eq!(h.engine.probes(), 0);
    }

    #[tokio::test]
    async fn test_page_creation_failure() {
        let h = harness(MockEngine::serving("x"), |_| {});
        h.engine.fail_open_page(Some(EngineError::Page("no target".into())));
        let req = RenderRequest::new(Method::GET, "/", "req-1");

        let err = h.pipeline.handle(&req).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PageCreationFailed);
        assert_eq!(h.engine.navigations(), 0);
    }

    #[tokio::test]
    async fn test_pool_unavailable() {
        let h = harness(MockEngine::new(), |_| {});
        h.engine.set_fail_create(true);
        let req = RenderRequest::new(Method::GET, "/", "req-1");

        let err = h.pipeline.handle(&req).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BrowserUnavailable);
        assert_eq!(err.status(), 503);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_crash_triggers_recovery() {
        let h = harness(MockEngine::serving("x"), |_| {});
        h.engine.fail_navigation(Some(EngineError::Crashed));
        let req = RenderRequest::new(Method::GET, "/", "req-1");

        let err = h.pipeline.handle(&req).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NavigationFailed);
        assert!(err.crashed);
        assert!(logs_contain("Session crashed, attempting recovery"));

        settle().await;
        assert_eq!(h.engine.pages_closed(), 1);
        assert_eq!(h.engine.probes(), 1);
        assert_eq!(h.pipeline.pool().size(), 0);
        assert_eq!(h.engine.closed(), 1);
    }

    #[tokio::test]
    async fn test_cookies_flow_both_ways() {
        let h = harness(MockEngine::serving("x"), |s| s.forward_cookies = true);
        h.engine.set_upstream_cookies(vec![SessionCookie {
            name: "sid".into(),
            value: "new".into(),
            path: "/".into(),
            http_only: true,
            ..Default::default()
        }]);
        h.engine.reject_cookie("bad");
        let req = RenderRequest::new(Method::GET, "/", "req-1")
            .with_header("cookie", "sid=old; bad=1; theme=dark");

        let response = h.pipeline.handle(&req).await.unwrap();
        let received = h.engine.received_cookies();
        let names: Vec<_> = received.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["sid", "theme"]);
        assert!(received
            .iter()
            .all(|c| c.domain.as_deref() == Some("upstream.test")));
        assert_eq!(response.header("set-cookie"), Some("sid=new; Path=/; HttpOnly"));
    }

    #[tokio::test]
    async fn test_cookies_do_not_leak_between_requests() {
        let h = harness(MockEngine::serving("x"), |s| {
            s.forward_cookies = true;
            s.max_browsers = 1;
        });
        let set_cookies = |response: &RenderResponse| -> Vec<String> {
            response
                .headers
                .get_all(SET_COOKIE)
                .iter()
                .map(|v| v.to_str().unwrap().to_string())
                .collect()
        };

        let first = h
            .pipeline
            .handle(&RenderRequest::new(Method::GET, "/", "req-1").with_header("cookie", "a=1"))
            .await
            .unwrap();
        assert!(set_cookies(&first).iter().any(|c| c.starts_with("a=1")));

        let second = h
            .pipeline
            .handle(&RenderRequest::new(Method::GET, "/", "req-2").with_header("cookie", "b=2"))
            .await
            .unwrap();
        let second = set_cookies(&second);
        assert!(second.iter().any(|c| c.starts_with("b=2")));
        assert!(second.iter().all(|c| !c.starts_with("a=")));

        let third = h
            .pipeline
            .handle(&RenderRequest::new(Method::GET, "/", "req-3"))
            .await
            .unwrap();
        assert!(set_cookies(&third).is_empty());

        assert_eq!(h.engine.created(), 1);
        assert_eq!(h.engine.cookie_clears(), 3);
    }

    #[tokio::test]
    async fn test_working_page_released_after_request() {
        let h = harness(MockEngine::serving("x"), |_| {});
        h.pipeline
            .handle(&RenderRequest::new(Method::GET, "/", "req-1"))
            .await
            .unwrap();
        assert_eq!(h.engine.pages_released(), 1);

        h.engine
            .fail_navigation(Some(EngineError::Navigation("net::ERR_ABORTED".into())));
        h.pipeline
            .handle(&RenderRequest::new(Method::GET, "/", "req-2"))
            .await
            .unwrap_err();
        assert_eq!(h.engine.pages_released(), 2);
        assert_eq!(h.pipeline.pool().size(), 1);
    }

    #[tokio::test]
    async fn test_fetched_body_returned_verbatim() {
        let h = harness(MockEngine::new(), |s| {
            s.minify_content = true;
            s.optimize_resources = true;
        });
        let upstream = "{ \"deleted\" : true,\n  \"note\": \"a  b\" }";
        h.engine.push_script_result(Ok(json!({
            "status": 200,
            "statusText": "OK",
            "headers": {"content-type": "application/json"},
            "body": upstream
        })));

        let response = h
            .pipeline
            .handle(&RenderRequest::new(Method::DELETE, "/items/9", "req-1"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], upstream.as_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_renders_coalesce() {
        let h = harness(MockEngine::serving("shared"), |s| {
            s.cache_ttl = 60;
            s.max_browsers = 2;
        });
        h.engine.set_navigation_delay(Some(Duration::from_millis(500)));
        let a = RenderRequest::new(Method::GET, "/hot", "req-a");
        let b = RenderRequest::new(Method::GET, "/hot", "req-b");

        let (first, second) = tokio::join!(h.pipeline.handle(&a), h.pipeline.handle(&b));
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(h.engine.navigations(), 1);
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.body, second.body);
        assert_eq!(h.pipeline.flights.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_renders_run_concurrently() {
        let h = harness(MockEngine::serving("x"), |s| s.cache_ttl = 60);
        h.engine.set_navigation_delay(Some(Duration::from_secs(1)));
        let a = RenderRequest::new(Method::GET, "/a", "req-a");
        let b = RenderRequest::new(Method::GET, "/b", "req-b");

        let started = tokio::time::Instant::now();
        let (first, second) = tokio::join!(h.pipeline.handle(&a), h.pipeline.handle(&b));
        assert!(first.is_ok() && second.is_ok());
        assert_eq!(h.engine.navigations(), 2);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cookies_ignored_when_not_forwarding() {
        let h = harness(MockEngine::serving("x"), |_| {});
        h.engine.set_upstream_cookies(vec![SessionCookie {
            name: "sid".into(),
            value: "new".into(),
            ..Default::default()
        }]);
        let req = RenderRequest::new(Method::GET, "/", "req-1").with_header("cookie", "sid=old");

        let response = h.pipeline.handle(&req).await.unwrap();
        assert!(h.engine.received_cookies().is_empty());
        assert!(response.header("set-cookie").is_none());
    }

    #[tokio::test]
    async fn test_forward_headers_injected() {
        let h = harness(MockEngine::serving("x"), |_| {});
        let req = RenderRequest::new(Method::GET, "/", "req-1")
            .with_header("accept-language", "de-DE")
            .with_header("x-other", "ignored");

        h.pipeline.handle(&req).await.unwrap();
        let injectors = h.engine.injectors();
        assert_eq!(injectors.len(), 1);
        assert_eq!(
            injectors[0].headers(),
            &[("Accept-Language".to_string(), "de-DE".to_string())]
        );
    }

    #[tokio::test]
    async fn test_scripts_disabled() {
        let h = harness(MockEngine::serving("x"), |s| s.enable_js = false);
        h.pipeline
            .handle(&RenderRequest::new(Method::GET, "/", "req-1"))
            .await
            .unwrap();
        assert_eq!(h.engine.script_enabled(), Some(false));

        let h = harness(MockEngine::serving("x"), |_| {});
        h.pipeline
            .handle(&RenderRequest::new(Method::GET, "/", "req-1"))
            .await
            .unwrap();
        assert_eq!(h.engine.script_enabled(), None);
    }

    #[tokio::test]
    async fn test_optimized_render() {
        let html = "<html><head><script>track()</script></head><body><p>Hi</p></body></html>";
        let h = harness(MockEngine::serving(html), |s| s.optimize_resources = true);

        let response = h
            .pipeline
            .handle(&RenderRequest::new(Method::GET, "/", "req-1"))
            .await
            .unwrap();
        let body = String::from_utf8(response.body.to_vec()).unwrap();
        assert!(!body.contains("track()"));
        assert!(body.contains("<p>Hi</p>"));
    }
}
