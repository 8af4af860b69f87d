//! ProxyServer struct and main run loop.
//!
//! The server owns every shared component: session pool, response cache,
//! health monitor and metrics. It accepts HTTP/1.1 connections until the
//! shutdown future resolves, then stops the monitor and closes the pool.

use super::handler::{handle_request, ProxyState};
use super::network::{bind_addr, create_reusable_listener};
use super::pipeline::RenderPipeline;
use super::response::{full_response, ResponseExt};
use super::status::StatusSource;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::pool::health::HealthMonitor;
use crate::pool::SessionPool;
use crate::session::SessionFactory;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const METRICS_PATH: &str = "/metrics";

pub struct ProxyServer {
    config: Arc<Config>,
    state: Arc<ProxyState>,
    pool: Arc<SessionPool>,
    monitor: Arc<HealthMonitor>,
    metrics: Arc<Metrics>,
    engine: String,
}

impl ProxyServer {
    /// Wire the components for `config` on top of `factory`.
    pub fn new(config: Config, factory: Arc<dyn SessionFactory>) -> Result<Self, anyhow::Error> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new()?);
        let engine = factory.name().to_string();

        let pool = Arc::new(SessionPool::new(
            factory,
            config.proxy.max_browsers,
            metrics.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(
            config.proxy.cache_ttl(),
            config.proxy.forward_headers.clone(),
            config.proxy.forward_cookies,
        ));
        let monitor = Arc::new(HealthMonitor::new(
            pool.clone(),
            config.health.interval(),
            config.health.probe_timeout(),
            metrics.clone(),
        ));
        let pipeline = RenderPipeline::new(
            config.proxy.clone(),
            pool.clone(),
            cache.clone(),
            metrics.clone(),
            config.health.probe_timeout(),
        )?;

        let state = Arc::new(ProxyState {
            pipeline,
            status: StatusSource {
                pool: pool.clone(),
                cache,
                health: monitor.state(),
                started_at: Instant::now(),
            },
            metrics: metrics.clone(),
        });

        Ok(Self {
            config: Arc::new(config),
            state,
            pool,
            monitor,
            metrics,
            engine,
        })
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Bind the configured ports and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()>,
    {
        let listener = create_reusable_listener(bind_addr(self.config.listen.port))?;
        let metrics_listener = TcpListener::bind(bind_addr(self.config.metrics.port)).await?;
        self.serve(listener, Some(metrics_listener), shutdown).await
    }

    /// Serve on already-bound listeners until `shutdown` resolves.
    pub async fn serve<F>(
        self,
        listener: TcpListener,
        metrics_listener: Option<TcpListener>,
        shutdown: F,
    ) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        info!("Listening on http://{}", addr);
        info!("Rendering {} with {} engine", self.config.proxy.upstream, self.engine);
        info!(
            "Session pool up to {} sessions, cache ttl {}s",
            self.config.proxy.max_browsers, self.config.proxy.cache_ttl
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let monitor_task = self.monitor.clone().spawn(shutdown_tx.subscribe());
        let metrics_task = metrics_listener.map(|l| {
            tokio::spawn(serve_metrics(l, self.metrics.clone(), shutdown_tx.subscribe()))
        });

        self.pool.warm_up().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move { handle_request(&state, req).await }
                        });
                        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                            debug!("Error serving connection from {}: {}", remote_addr, err);
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(());
        if let Err(e) = monitor_task.await {
            warn!("Health monitor task failed: {}", e);
        }
        if let Some(task) = metrics_task {
            if let Err(e) = task.await {
                warn!("Metrics server task failed: {}", e);
            }
        }
        if let Err(e) = self.pool.shutdown().await {
            error!("Session pool shutdown incomplete: {}", e);
        }
        info!("Server stopped");
        Ok(())
    }
}

async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("Metrics available at http://{}{}", addr, METRICS_PATH);
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let metrics = metrics.clone();
                        async move { Ok::<_, Infallible>(metrics_response(&metrics, &req).into_boxed()) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!("Metrics connection error: {}", e);
                    }
                });
            }
            _ = shutdown.recv() => break,
        }
    }
}

fn metrics_response<B>(metrics: &Metrics, req: &Request<B>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET || req.uri().path() != METRICS_PATH {
        return full_response(404, "Not Found");
    }
    match metrics.encode() {
        Ok(body) => {
            let mut response = full_response(200, body);
            if let Ok(value) = "text/plain; version=0.0.4".parse() {
                response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            full_response(500, "Failed to encode metrics")
        }
    }
}
