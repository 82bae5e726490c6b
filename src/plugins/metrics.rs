//! Metrics plugin exporting Prometheus counters and histograms for request lifecycle
//! and connection events.
//!
//! [`MetricsSink`] owns a [`prometheus::Registry`] and subscribes to the
//! [`crate::signals`] event bus for connection open/close counts, while
//! [`MetricsPlugin`] installs the request-timing middleware that drives the per-route
//! counters and histogram. The two are split because a sink can outlive any one
//! router (e.g. shared across a hot-reloaded router) while the plugin is what actually
//! wires it into a specific router's middleware chain.
//!
//! # Examples
//!
//! ```rust
//! use tako::plugins::metrics::MetricsSink;
//! use tako::plugins::TakoPlugin;
//! use tako::router::Router;
//!
//! let sink = MetricsSink::new().expect("metric registration");
//! let mut router = Router::new();
//! router.plugin(sink.clone().plugin());
//! ```

use std::time::{Duration, Instant};

use anyhow::Result;
use prometheus::{
  Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
  register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
  register_int_counter_with_registry, register_int_gauge_with_registry,
};

use crate::{
  middleware::Next,
  plugins::TakoPlugin,
  signals::{EventBus, Signal, ids},
  types::Request,
};

/// Holds the Prometheus collectors and renders them as the text exposition format.
///
/// Cheap to clone: every field is either `Arc`-backed or already a handle type from
/// `prometheus` that wraps its own shared state.
#[derive(Clone)]
pub struct MetricsSink {
  registry: Registry,
  requests_total: IntCounterVec,
  request_duration_seconds: HistogramVec,
  connections_open: IntGauge,
  cache_hits_total: IntCounter,
  cache_misses_total: IntCounter,
  slow_requests_total: IntCounter,
  slow_threshold: Duration,
  uptime_seconds: IntGauge,
  started_at: Instant,
}

impl MetricsSink {
  /// Creates a sink with a fresh registry and registers its collectors on it.
  ///
  /// Fails only if collector registration itself fails (e.g. a name collision), which
  /// can't happen with a freshly created registry but is surfaced anyway since the
  /// underlying `prometheus` calls are fallible. The slow-request threshold defaults to
  /// one second; override it with [`MetricsSink::with_slow_threshold`].
  pub fn new() -> Result<Self> {
    let registry = Registry::new();

    let requests_total = register_int_counter_vec_with_registry!(
      "tako_requests_total",
      "Total number of requests handled, labeled by method, path, and status class.",
      &["method", "path", "status"],
      registry
    )?;

    let request_duration_seconds = register_histogram_vec_with_registry!(
      "tako_request_duration_seconds",
      "Request handling duration in seconds, labeled by method and path.",
      &["method", "path"],
      registry
    )?;

    let connections_open = register_int_gauge_with_registry!(
      "tako_connections_open",
      "Number of currently open connections.",
      registry
    )?;

    let cache_hits_total = register_int_counter_with_registry!(
      "tako_cache_hits_total",
      "Total number of static file requests served from the in-memory cache.",
      registry
    )?;

    let cache_misses_total = register_int_counter_with_registry!(
      "tako_cache_misses_total",
      "Total number of static file requests that required a disk read.",
      registry
    )?;

    let slow_requests_total = register_int_counter_with_registry!(
      "tako_slow_requests_total",
      "Total number of requests whose handling time exceeded the configured threshold.",
      registry
    )?;

    let uptime_seconds = register_int_gauge_with_registry!(
      "tako_uptime_seconds",
      "Seconds since this metrics sink was created.",
      registry
    )?;

    // Registers `process_cpu_seconds_total`, `process_resident_memory_bytes`, and the
    // rest of the standard process metrics directly on our registry; only available on
    // Linux, where `procfs` backs it, so it's skipped (not failed) elsewhere.
    #[cfg(target_os = "linux")]
    registry.register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))?;

    Ok(Self {
      registry,
      requests_total,
      request_duration_seconds,
      connections_open,
      cache_hits_total,
      cache_misses_total,
      slow_requests_total,
      slow_threshold: Duration::from_secs(1),
      uptime_seconds,
      started_at: Instant::now(),
    })
  }

  /// Overrides the duration above which a request counts toward
  /// `tako_slow_requests_total`.
  pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
    self.slow_threshold = threshold;
    self
  }

  /// Subscribes this sink to connection lifecycle and cache signals on `events`, so
  /// `tako_connections_open`, `tako_cache_hits_total`, and `tako_cache_misses_total`
  /// track their sources wherever they're emitted from (the listener loops, a
  /// [`crate::static_cache::StaticCache`], or a host binding's own bookkeeping).
  pub fn subscribe(&self, events: &EventBus) {
    let gauge = self.connections_open.clone();
    events.on(ids::CONNECTION_OPENED, move |_signal: Signal| {
      let gauge = gauge.clone();
      async move { gauge.inc() }
    });

    let gauge = self.connections_open.clone();
    events.on(ids::CONNECTION_CLOSED, move |_signal: Signal| {
      let gauge = gauge.clone();
      async move { gauge.dec() }
    });

    let hits = self.cache_hits_total.clone();
    events.on(ids::CACHE_HIT, move |_signal: Signal| {
      let hits = hits.clone();
      async move { hits.inc() }
    });

    let misses = self.cache_misses_total.clone();
    events.on(ids::CACHE_MISS, move |_signal: Signal| {
      let misses = misses.clone();
      async move { misses.inc() }
    });
  }

  /// Wraps this sink in a [`MetricsPlugin`] ready to hand to `router.plugin(...)`.
  pub fn plugin(self) -> MetricsPlugin {
    MetricsPlugin { sink: self }
  }

  /// Renders every registered collector in the Prometheus text exposition format.
  ///
  /// Intended to be served from a handler mounted at `/metrics` by the embedding
  /// application; this module only produces the bytes, it doesn't own a route. Samples
  /// `tako_uptime_seconds` at render time rather than on a timer, since nothing else
  /// needs its intermediate values.
  pub fn render(&self) -> Result<String> {
    self
      .uptime_seconds
      .set(self.started_at.elapsed().as_secs() as i64);

    let metric_families = self.registry.gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
  }

  fn observe(&self, method: &str, path: &str, status: u16, elapsed_secs: f64) {
    let status_class = match status {
      100..=199 => "1xx",
      200..=299 => "2xx",
      300..=399 => "3xx",
      400..=499 => "4xx",
      _ => "5xx",
    };
    self
      .requests_total
      .with_label_values(&[method, path, status_class])
      .inc();
    self
      .request_duration_seconds
      .with_label_values(&[method, path])
      .observe(elapsed_secs);

    if elapsed_secs >= self.slow_threshold.as_secs_f64() {
      self.slow_requests_total.inc();
    }
  }
}

/// Plugin that times every request through the router it's installed on and records it
/// on the wrapped [`MetricsSink`].
#[derive(Clone)]
pub struct MetricsPlugin {
  sink: MetricsSink,
}

impl MetricsPlugin {
  /// Returns the sink backing this plugin, for mounting a `/metrics` route against.
  pub fn sink(&self) -> MetricsSink {
    self.sink.clone()
  }
}

impl TakoPlugin for MetricsPlugin {
  fn name(&self) -> &'static str {
    "MetricsPlugin"
  }

  fn setup(&self, router: &crate::router::Router) -> Result<()> {
    let sink = self.sink.clone();
    router.middleware(move |req: Request, next: Next| {
      let sink = sink.clone();
      async move {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let start = Instant::now();
        let resp = next.run(req).await;
        sink.observe(&method, &path, resp.status().as_u16(), start.elapsed().as_secs_f64());
        resp
      }
    });
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{body::TakoBody, router::Router, signals::SignalArbiter};
  use http::Method;
  use http_body_util::BodyExt;

  fn get(path: &str) -> Request {
    Request::builder()
      .method(Method::GET)
      .uri(path)
      .body(TakoBody::empty())
      .unwrap()
  }

  #[tokio::test]
  async fn request_through_router_increments_counter_and_renders() {
    let sink = MetricsSink::new().unwrap();
    let mut router = Router::new();
    router.plugin(sink.clone().plugin());
    router.route(Method::GET, "/ping", |_req: Request| async { "pong" });

    let resp = router.dispatch(get("/ping")).await;
    let _ = resp.into_body().collect().await.unwrap().to_bytes();

    let rendered = sink.render().unwrap();
    assert!(rendered.contains("tako_requests_total"));
    assert!(rendered.contains("tako_request_duration_seconds"));
  }

  #[tokio::test]
  async fn connection_signals_move_the_open_gauge() {
    let sink = MetricsSink::new().unwrap();
    let events = SignalArbiter::new();
    sink.subscribe(&events);

    events.emit(Signal::new(ids::CONNECTION_OPENED)).await;
    events.emit(Signal::new(ids::CONNECTION_OPENED)).await;
    events.emit(Signal::new(ids::CONNECTION_CLOSED)).await;

    let rendered = sink.render().unwrap();
    assert!(rendered.contains("tako_connections_open 1"));
  }

  #[tokio::test]
  async fn cache_signals_move_hit_and_miss_counters() {
    let sink = MetricsSink::new().unwrap();
    let events = SignalArbiter::new();
    sink.subscribe(&events);

    events.emit(Signal::new(ids::CACHE_MISS)).await;
    events.emit(Signal::new(ids::CACHE_HIT)).await;
    events.emit(Signal::new(ids::CACHE_HIT)).await;

    let rendered = sink.render().unwrap();
    assert!(rendered.contains("tako_cache_misses_total 1"));
    assert!(rendered.contains("tako_cache_hits_total 2"));
  }

  #[tokio::test]
  async fn slow_requests_increment_past_threshold() {
    let sink = MetricsSink::new().unwrap().with_slow_threshold(Duration::from_millis(10));
    sink.observe("GET", "/fast", 200, 0.001);
    sink.observe("GET", "/slow", 200, 0.5);

    let rendered = sink.render().unwrap();
    assert!(rendered.contains("tako_slow_requests_total 1"));
  }

  #[tokio::test]
  async fn uptime_gauge_is_present_on_render() {
    let sink = MetricsSink::new().unwrap();
    let rendered = sink.render().unwrap();
    assert!(rendered.contains("tako_uptime_seconds"));
  }
}
