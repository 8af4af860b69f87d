//! Prometheus metrics for headless-proxy.
//!
//! Collectors live in a [`Metrics`] value with its own registry and are handed
//! to each component, so independent proxies (and tests) never share counters.

use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts,
    HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

const PREFIX: &str = "headless_proxy";

pub struct Metrics {
    registry: Registry,
    requests_total: CounterVec,
    request_duration_seconds: HistogramVec,
    request_size_bytes: HistogramVec,
    response_size_bytes: HistogramVec,
    response_status_code_total: CounterVec,
    cache_hits_total: Counter,
    cache_misses_total: Counter,
    browser_pool_size: Gauge,
    browser_created_total: Counter,
    browser_closed_total: Counter,
    browser_render_time_seconds: Histogram,
    browser_errors_total: CounterVec,
    optimization_savings_bytes: Histogram,
    browser_health: GaugeVec,
}

fn name(metric: &str) -> String {
    format!("{PREFIX}_{metric}")
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let size_buckets = exponential_buckets(64.0, 4.0, 10)?;

        let requests_total = CounterVec::new(
            Opts::new(name("requests_total"), "Total number of requests handled"),
            &["method", "status"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                name("request_duration_seconds"),
                "Request duration in seconds, including rendering",
            )
            .buckets(vec![
                0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ]),
            &["method", "status"],
        )?;
        let request_size_bytes = HistogramVec::new(
            HistogramOpts::new(name("request_size_bytes"), "Inbound request body size")
                .buckets(size_buckets.clone()),
            &["method"],
        )?;
        let response_size_bytes = HistogramVec::new(
            HistogramOpts::new(name("response_size_bytes"), "Response body size")
                .buckets(size_buckets.clone()),
            &["method", "status"],
        )?;
        let response_status_code_total = CounterVec::new(
            Opts::new(
                name("response_status_code_total"),
                "Responses by status code",
            ),
            &["status_code"],
        )?;
        let cache_hits_total = Counter::new(name("cache_hits_total"), "Response cache hits")?;
        let cache_misses_total =
            Counter::new(name("cache_misses_total"), "Response cache misses")?;
        let browser_pool_size = Gauge::new(
            name("browser_pool_size"),
            "Sessions currently idle in the pool",
        )?;
        let browser_created_total =
            Counter::new(name("browser_created_total"), "Sessions created")?;
        let browser_closed_total = Counter::new(name("browser_closed_total"), "Sessions closed")?;
        let browser_render_time_seconds = Histogram::with_opts(
            HistogramOpts::new(
                name("browser_render_time_seconds"),
                "Time spent driving a session for one request",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let browser_errors_total = CounterVec::new(
            Opts::new(name("browser_errors_total"), "Pipeline errors by kind"),
            &["error_type"],
        )?;
        let optimization_savings_bytes = Histogram::with_opts(
            HistogramOpts::new(
                name("optimization_savings_bytes"),
                "Bytes removed by the content optimizer",
            )
            .buckets(size_buckets),
        )?;
        let browser_health = GaugeVec::new(
            Opts::new(
                name("browser_health"),
                "Sessions by outcome of the last health cycle",
            ),
            &["state"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(request_size_bytes.clone()))?;
        registry.register(Box::new(response_size_bytes.clone()))?;
        registry.register(Box::new(response_status_code_total.clone()))?;
        registry.register(Box::new(cache_hits_total.clone()))?;
        registry.register(Box::new(cache_misses_total.clone()))?;
        registry.register(Box::new(browser_pool_size.clone()))?;
        registry.register(Box::new(browser_created_total.clone()))?;
        registry.register(Box::new(browser_closed_total.clone()))?;
        registry.register(Box::new(browser_render_time_seconds.clone()))?;
        registry.register(Box::new(browser_errors_total.clone()))?;
        registry.register(Box::new(optimization_savings_bytes.clone()))?;
        registry.register(Box::new(browser_health.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            request_size_bytes,
            response_size_bytes,
            response_status_code_total,
            cache_hits_total,
            cache_misses_total,
            browser_pool_size,
            browser_created_total,
            browser_closed_total,
            browser_render_time_seconds,
            browser_errors_total,
            optimization_savings_bytes,
            browser_health,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Collect all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn record_request(
        &self,
        method: &str,
        status: u16,
        duration: Duration,
        request_size: usize,
        response_size: usize,
    ) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[method, &status])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[method, &status])
            .observe(duration.as_secs_f64());
        self.request_size_bytes
            .with_label_values(&[method])
            .observe(request_size as f64);
        self.response_size_bytes
            .with_label_values(&[method, &status])
            .observe(response_size as f64);
        self.response_status_code_total
            .with_label_values(&[&status])
            .inc();
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits_total.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses_total.inc();
    }

    pub fn set_pool_size(&self, size: usize) {
        self.browser_pool_size.set(size as f64);
    }

    pub fn record_session_created(&self) {
        self.browser_created_total.inc();
    }

    pub fn record_session_closed(&self) {
        self.browser_closed_total.inc();
    }

    pub fn record_render_time(&self, elapsed: Duration) {
        self.browser_render_time_seconds
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_error(&self, error_type: &str) {
        self.browser_errors_total
            .with_label_values(&[error_type])
            .inc();
    }

    pub fn record_optimization_savings(&self, bytes: usize) {
        self.optimization_savings_bytes.observe(bytes as f64);
    }

    pub fn set_health(&self, healthy: usize, unhealthy: usize) {
        self.browser_health
            .with_label_values(&["healthy"])
            .set(healthy as f64);
        self.browser_health
            .with_label_values(&["unhealthy"])
            .set(unhealthy as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collection() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("GET", 200, Duration::from_millis(120), 0, 2048);
        metrics.record_cache_hit();
        metrics.record_cache_miss();

        let text = metrics.encode().unwrap();
        assert!(text.contains("headless_proxy_requests_total"));
        assert!(text.contains("headless_proxy_request_duration_seconds"));
        assert!(text.contains("headless_proxy_response_status_code_total"));
        assert!(text.contains("headless_proxy_cache_hits_total 1"));
        assert!(text.contains("headless_proxy_cache_misses_total 1"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_session_created();
        a.record_session_created();

        assert!(a.encode().unwrap().contains("headless_proxy_browser_created_total 2"));
        assert!(b.encode().unwrap().contains("headless_proxy_browser_created_total 0"));
    }

    #[test]
    fn test_session_and_error_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.set_pool_size(3);
        metrics.record_session_closed();
        metrics.record_error("timeout");
        metrics.record_render_time(Duration::from_millis(800));
        metrics.record_optimization_savings(512);
        metrics.set_health(2, 1);

        let text = metrics.encode().unwrap();
        assert!(text.contains("headless_proxy_browser_pool_size 3"));
        assert!(text.contains("headless_proxy_browser_closed_total 1"));
        assert!(text.contains(r#"headless_proxy_browser_errors_total{error_type="timeout"} 1"#));
        assert!(text.contains("headless_proxy_browser_render_time_seconds"));
        assert!(text.contains("headless_proxy_optimization_savings_bytes"));
        assert!(text.contains(r#"headless_proxy_browser_health{state="unhealthy"} 1"#));
    }
}
