use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Pipeline metrics.
///
/// Handles are registered against whatever recorder is installed when
/// `Metrics::new` runs, so the Prometheus exporter must be started first.
/// Local tallies mirror the counters for health checks and CLI summaries.
pub struct Metrics {
    pub captures_succeeded: Counter,
    pub captures_failed: Counter,
    pub capture_duration: Histogram,
    pub renderer_launches: Counter,
    pub readiness_fallbacks: Counter,
    pub storage_upload_failures: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub active_captures: Gauge,
    tallies: Tallies,
    started_at: Instant,
}

#[derive(Default)]
struct Tallies {
    captures_succeeded: AtomicU64,
    captures_failed: AtomicU64,
    renderer_launches: AtomicU64,
    readiness_fallbacks: AtomicU64,
    storage_upload_failures: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    active_captures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            captures_succeeded: register_counter!("page_capture_captures_succeeded_total"),
            captures_failed: register_counter!("page_capture_captures_failed_total"),
            capture_duration: register_histogram!("page_capture_capture_duration_seconds"),
            renderer_launches: register_counter!("page_capture_renderer_launches_total"),
            readiness_fallbacks: register_counter!("page_capture_readiness_fallbacks_total"),
            storage_upload_failures: register_counter!(
                "page_capture_storage_upload_failures_total"
            ),
            jobs_completed: register_counter!("page_capture_jobs_completed_total"),
            jobs_failed: register_counter!("page_capture_jobs_failed_total"),
            active_captures: register_gauge!("page_capture_active_captures"),
            tallies: Tallies::default(),
            started_at: Instant::now(),
        }
    }

    pub fn record_capture(&self, duration: Duration, success: bool) {
        if success {
            self.captures_succeeded.increment(1);
            self.tallies.captures_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.captures_failed.increment(1);
            self.tallies.captures_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.capture_duration.record(duration.as_secs_f64());
    }

    pub fn capture_started(&self) {
        let active = self.tallies.active_captures.fetch_add(1, Ordering::Relaxed) + 1;
        self.active_captures.set(active as f64);
    }

    pub fn capture_finished(&self) {
        let previous = self
            .tallies
            .active_captures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        self.active_captures.set(previous.saturating_sub(1) as f64);
    }

    pub fn record_renderer_launch(&self) {
        self.renderer_launches.increment(1);
        self.tallies.renderer_launches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_readiness_fallback(&self) {
        self.readiness_fallbacks.increment(1);
        self.tallies.readiness_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload_failure(&self) {
        self.storage_upload_failures.increment(1);
        self.tallies
            .storage_upload_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job(&self, completed: bool) {
        if completed {
            self.jobs_completed.increment(1);
            self.tallies.jobs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_failed.increment(1);
            self.tallies.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let t = &self.tallies;
        MetricsSnapshot {
            captures_succeeded: t.captures_succeeded.load(Ordering::Relaxed),
            captures_failed: t.captures_failed.load(Ordering::Relaxed),
            renderer_launches: t.renderer_launches.load(Ordering::Relaxed),
            readiness_fallbacks: t.readiness_fallbacks.load(Ordering::Relaxed),
            storage_upload_failures: t.storage_upload_failures.load(Ordering::Relaxed),
            jobs_completed: t.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: t.jobs_failed.load(Ordering::Relaxed),
            active_captures: t.active_captures.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub captures_succeeded: u64,
    pub captures_failed: u64,
    pub renderer_launches: u64,
    pub readiness_fallbacks: u64,
    pub storage_upload_failures: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub active_captures: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    pub fn capture_failure_rate(&self) -> f64 {
        let total = self.captures_succeeded + self.captures_failed;
        if total == 0 {
            0.0
        } else {
            self.captures_failed as f64 / total as f64
        }
    }
}

/// Serves `/metrics` in Prometheus text format.
pub struct PrometheusExporter {
    port: u16,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Install the global recorder and start the HTTP listener. Must run
    /// inside a tokio runtime.
    pub fn start(&self) -> Result<(), metrics_exporter_prometheus::BuildError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;

        info!("Prometheus metrics available on http://{}/metrics", addr);
        Ok(())
    }
}
