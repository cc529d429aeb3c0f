//! Metrics collection for Lockstep
//!
//! Prometheus metrics for the chat endpoint and the execution group. The
//! coordinator exposes them on `/metrics`.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for Lockstep
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub chat: ChatMetrics,
    pub group: GroupMetrics,
}

/// Chat endpoint metrics
#[derive(Debug, Clone)]
pub struct ChatMetrics {
    /// Total number of chat requests
    pub requests_total: IntCounter,

    /// Total number of successful requests
    pub requests_success: IntCounter,

    /// Total number of failed requests
    pub requests_failed: IntCounter,

    /// Requests rejected before dispatch, by error code
    pub requests_rejected: IntCounterVec,

    /// End-to-end request duration
    pub request_duration: Histogram,

    /// Time spent waiting for the dispatch lock
    pub lock_wait: Histogram,

    /// Requests holding or waiting for the dispatch lock
    pub active_requests: IntGauge,
}

/// Execution group metrics
#[derive(Debug, Clone)]
pub struct GroupMetrics {
    /// 1 while the group accepts requests
    pub ready: IntGauge,

    /// Worker units currently alive
    pub live_workers: IntGauge,

    /// Time from fan-out until a rank's output arrived
    pub rank_latency: HistogramVec,

    /// Requests whose ranks disagreed on input or output
    pub rank_divergence: IntCounter,

    /// Transitions into the failed state
    pub group_failures: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Chat metrics
        let requests_total = IntCounter::new(
            "chat_requests_total",
            "Total number of chat requests"
        ).unwrap();

        let requests_success = IntCounter::new(
            "chat_requests_success_total",
            "Total number of successful chat requests"
        ).unwrap();

        let requests_failed = IntCounter::new(
            "chat_requests_failed_total",
            "Total number of failed chat requests"
        ).unwrap();

        let requests_rejected = IntCounterVec::new(
            prometheus::Opts::new(
                "chat_requests_rejected_total",
                "Chat requests rejected by validation"
            ),
            &["code"]
        ).unwrap();

        let request_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "chat_request_duration_seconds",
                "Chat request duration in seconds"
            ).buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0])
        ).unwrap();

        let lock_wait = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "chat_dispatch_lock_wait_seconds",
                "Time spent waiting for the dispatch lock"
            ).buckets(vec![0.0001, 0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0])
        ).unwrap();

        let active_requests = IntGauge::new(
            "chat_active_requests",
            "Chat requests holding or waiting for the dispatch lock"
        ).unwrap();

        // Group metrics
        let ready = IntGauge::new(
            "group_ready",
            "Whether the execution group accepts requests"
        ).unwrap();

        let live_workers = IntGauge::new(
            "group_live_workers",
            "Worker units currently alive"
        ).unwrap();

        let rank_latency = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "group_rank_latency_seconds",
                "Time from fan-out until a rank answered"
            ).buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["rank"]
        ).unwrap();

        let rank_divergence = IntCounter::new(
            "group_rank_divergence_total",
            "Requests whose ranks disagreed on input or output"
        ).unwrap();

        let group_failures = IntCounter::new(
            "group_failures_total",
            "Transitions of the execution group into the failed state"
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(requests_success.clone())).unwrap();
        registry.register(Box::new(requests_failed.clone())).unwrap();
        registry.register(Box::new(requests_rejected.clone())).unwrap();
        registry.register(Box::new(request_duration.clone())).unwrap();
        registry.register(Box::new(lock_wait.clone())).unwrap();
        registry.register(Box::new(active_requests.clone())).unwrap();

        registry.register(Box::new(ready.clone())).unwrap();
        registry.register(Box::new(live_workers.clone())).unwrap();
        registry.register(Box::new(rank_latency.clone())).unwrap();
        registry.register(Box::new(rank_divergence.clone())).unwrap();
        registry.register(Box::new(group_failures.clone())).unwrap();

        let chat = ChatMetrics {
            requests_total,
            requests_success,
            requests_failed,
            requests_rejected,
            request_duration,
            lock_wait,
            active_requests,
        };

        let group = GroupMetrics {
            ready,
            live_workers,
            rank_latency,
            rank_divergence,
            group_failures,
        };

        MetricsRegistry {
            registry,
            chat,
            group,
        }
    }

    /// Gather all metrics in the Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the time elapsed since `start`
    fn observe_since(&self, start: std::time::Instant);
}

impl LatencyTimer for Histogram {
    fn observe_since(&self, start: std::time::Instant) {
        self.observe(start.elapsed().as_secs_f64());
    }
}
