//! Controller metrics: the recorder interface and the shipped backends.

use parking_lot::Mutex;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::Arc;
use tokio::time::Instant;

const NAMESPACE: &str = "controller";
const SUBSYSTEM: &str = "runtime";

/// Closure reporting the current queue length, evaluated at scrape time.
pub type QueueLenFn = Box<dyn Fn() -> usize + Send + Sync>;

/// Sink for the observable events of a controller.
///
/// Implementations must be safe for concurrent use; every method is called
/// from workers and the informer without further synchronization.
pub trait MetricsRecorder: Send + Sync {
    /// A key was enqueued. `requeue` distinguishes retries from fresh
    /// notifications.
    fn queued_event(&self, controller: &str, requeue: bool);

    /// A key was dequeued after sitting in the queue since `queued_at`.
    fn in_queue_duration(&self, controller: &str, queued_at: Instant);

    /// A processing attempt that started at `started_at` finished, with
    /// the given outcome.
    fn processing_duration(&self, controller: &str, success: bool, started_at: Instant);

    /// Register the queue-length gauge for `controller`. Called once per
    /// controller, at construction.
    fn register_queue_length(&self, controller: &str, len_fn: QueueLenFn);
}

/// Recorder that discards everything. The default.
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn queued_event(&self, _controller: &str, _requeue: bool) {}
    fn in_queue_duration(&self, _controller: &str, _queued_at: Instant) {}
    fn processing_duration(&self, _controller: &str, _success: bool, _started_at: Instant) {}
    fn register_queue_length(&self, _controller: &str, _len_fn: QueueLenFn) {}
}

/// Configuration for the [`PrometheusRecorder`].
pub struct PrometheusConfig {
    /// Registry to register the series in.
    pub registry: Registry,
    /// Buckets for the in-queue latency histogram.
    pub in_queue_buckets: Vec<f64>,
    /// Buckets for the processing latency histogram.
    pub processing_buckets: Vec<f64>,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            registry: Registry::new(),
            in_queue_buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
            processing_buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        }
    }
}

/// Records controller metrics in a prometheus registry.
///
/// Series:
/// - `controller_runtime_queued_events_total{controller,requeue}`
/// - `controller_runtime_event_in_queue_duration_seconds{controller}`
/// - `controller_runtime_processed_event_duration_seconds{controller,success}`
/// - `controller_runtime_queue_length{controller}` (evaluated at scrape)
pub struct PrometheusRecorder {
    queued_events_total: IntCounterVec,
    in_queue_duration: HistogramVec,
    processing_duration: HistogramVec,
    queue_lengths: Arc<QueueLengthSet>,
}

impl PrometheusRecorder {
    /// Build and register the series described by `cfg`.
    pub fn new(cfg: PrometheusConfig) -> Result<Self, prometheus::Error> {
        let queued_events_total = IntCounterVec::new(
            Opts::new("queued_events_total", "Total number of events queued.")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM),
            &["controller", "requeue"],
        )?;
        let in_queue_duration = HistogramVec::new(
            HistogramOpts::new(
                "event_in_queue_duration_seconds",
                "The duration of an event in the queue.",
            )
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM)
            .buckets(cfg.in_queue_buckets),
            &["controller"],
        )?;
        let processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "processed_event_duration_seconds",
                "The duration for an event to be processed.",
            )
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM)
            .buckets(cfg.processing_buckets),
            &["controller", "success"],
        )?;
        let queue_lengths = Arc::new(QueueLengthSet::new()?);

        cfg.registry.register(Box::new(queued_events_total.clone()))?;
        cfg.registry.register(Box::new(in_queue_duration.clone()))?;
        cfg.registry.register(Box::new(processing_duration.clone()))?;
        cfg.registry.register(Box::new(QueueLengthCollector(
            Arc::clone(&queue_lengths),
        )))?;

        Ok(Self {
            queued_events_total,
            in_queue_duration,
            processing_duration,
            queue_lengths,
        })
    }
}

impl MetricsRecorder for PrometheusRecorder {
    fn queued_event(&self, controller: &str, requeue: bool) {
        self.queued_events_total
            .with_label_values(&[controller, if requeue { "true" } else { "false" }])
            .inc();
    }

    fn in_queue_duration(&self, controller: &str, queued_at: Instant) {
        self.in_queue_duration
            .with_label_values(&[controller])
            .observe(queued_at.elapsed().as_secs_f64());
    }

    fn processing_duration(&self, controller: &str, success: bool, started_at: Instant) {
        self.processing_duration
            .with_label_values(&[controller, if success { "true" } else { "false" }])
            .observe(started_at.elapsed().as_secs_f64());
    }

    fn register_queue_length(&self, controller: &str, len_fn: QueueLenFn) {
        self.queue_lengths
            .fns
            .lock()
            .push((controller.to_owned(), len_fn));
    }
}

/// The registered queue-length closures, rendered through a private gauge
/// at scrape time.
struct QueueLengthSet {
    gauge: IntGaugeVec,
    fns: Mutex<Vec<(String, QueueLenFn)>>,
}

impl QueueLengthSet {
    fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            gauge: IntGaugeVec::new(
                Opts::new("queue_length", "Number of keys waiting in the work queue.")
                    .namespace(NAMESPACE)
                    .subsystem(SUBSYSTEM),
                &["controller"],
            )?,
            fns: Mutex::new(Vec::new()),
        })
    }
}

struct QueueLengthCollector(Arc<QueueLengthSet>);

impl Collector for QueueLengthCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.0.gauge.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        for (controller, len_fn) in self.0.fns.lock().iter() {
            self.0
                .gauge
                .with_label_values(&[controller])
                .set(len_fn() as i64);
        }
        self.0.gauge.collect()
    }
}
