//! The controller loop: informer, cache sync, worker pool and shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::Handler;
use crate::informer::{DeletedObject, EventHandler, Informer};
use crate::leader::LeaderElector;
use crate::metrics::{MetricsRecorder, NoopRecorder};
use crate::processor::{IndexerProcessor, Processor, RetryProcessor};
use crate::queue::WorkQueue;
use crate::resource::ResourceObject;
use crate::retriever::{ListOptions, Retriever};
use crate::store::Store;
use crate::BoxError;

const DEFAULT_CONCURRENT_WORKERS: usize = 3;
const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(3 * 60);
const DEFAULT_PROCESSING_JOB_RETRIES: usize = 3;

/// Delay before a panicked worker is restarted.
const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Errors surfaced by [`Controller::new`] and [`Controller::run`].
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration is not usable; no controller is returned.
    #[error("invalid controller configuration: {0}")]
    InvalidConfiguration(String),
    /// `run` was called while another `run` is in progress.
    #[error("controller is already running")]
    AlreadyRunning,
    /// The context was cancelled before the cache completed its first sync.
    #[error("cancelled while waiting for the cache to sync")]
    SyncTimeout,
    /// The cache can never sync (the initial list failed).
    #[error("cache sync failed: {0}")]
    CacheSyncFailed(String),
    /// The leader elector lost the lease while the controller was running.
    #[error("leadership lost")]
    LeadershipLost,
    /// The leader elector failed for infrastructural reasons.
    #[error("leader election failed")]
    LeaderElection(#[source] BoxError),
}

/// Controller configuration.
///
/// The retriever and handler are required at construction; everything else
/// has a default. Defaults: no leader election, no metrics, 3 concurrent
/// workers, a 3 minute resync interval and 3 processing retries per key.
pub struct Config<K: ResourceObject> {
    /// Identifies the controller in logs and metrics. Required.
    pub name: String,
    /// Source of the reconciled resource class.
    pub retriever: Arc<dyn Retriever<K>>,
    /// The reconciliation logic.
    pub handler: Arc<dyn Handler<K>>,
    /// Single-writer gate; when set, the controller loop only runs while
    /// this instance holds the lease.
    pub leader_elector: Option<Arc<dyn LeaderElector>>,
    /// Metrics sink.
    pub metrics: Arc<dyn MetricsRecorder>,
    /// Number of workers processing keys in parallel. `0` means the
    /// default of 3.
    pub concurrent_workers: usize,
    /// How often the whole cache is replayed to the handler. Zero means
    /// the default of 3 minutes.
    pub resync_interval: Duration,
    /// Times a failing key is re-delivered before it is dropped. `None`
    /// means the default of 3; an explicit `Some(0)` disables retries.
    pub processing_job_retries: Option<usize>,
    /// Options forwarded to the retriever's list and watch calls.
    pub list_options: ListOptions,
}

impl<K: ResourceObject> Config<K> {
    /// Configuration with defaults for everything optional.
    pub fn new(
        name: impl Into<String>,
        retriever: Arc<dyn Retriever<K>>,
        handler: Arc<dyn Handler<K>>,
    ) -> Self {
        Self {
            name: name.into(),
            retriever,
            handler,
            leader_elector: None,
            metrics: Arc::new(NoopRecorder),
            concurrent_workers: 0,
            resync_interval: Duration::ZERO,
            processing_job_retries: None,
            list_options: ListOptions::default(),
        }
    }

    /// Gate the controller behind a leader elector.
    #[must_use]
    pub fn leader_elector(mut self, elector: Arc<dyn LeaderElector>) -> Self {
        self.leader_elector = Some(elector);
        self
    }

    /// Record metrics through `metrics`.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Process keys with `workers` parallel workers.
    #[must_use]
    pub fn concurrent_workers(mut self, workers: usize) -> Self {
        self.concurrent_workers = workers;
        self
    }

    /// Replay the cache every `interval`.
    #[must_use]
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Re-deliver a failing key up to `retries` times.
    #[must_use]
    pub fn processing_job_retries(mut self, retries: usize) -> Self {
        self.processing_job_retries = Some(retries);
        self
    }

    /// Restrict the retriever's list and watch calls.
    #[must_use]
    pub fn list_options(mut self, opts: ListOptions) -> Self {
        self.list_options = opts;
        self
    }

    fn validated(mut self) -> Result<Self, Error> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "a controller name is required".to_owned(),
            ));
        }
        if self.concurrent_workers == 0 {
            self.concurrent_workers = DEFAULT_CONCURRENT_WORKERS;
        }
        if self.resync_interval.is_zero() {
            self.resync_interval = DEFAULT_RESYNC_INTERVAL;
        }
        if self.processing_job_retries.is_none() {
            self.processing_job_retries = Some(DEFAULT_PROCESSING_JOB_RETRIES);
        }
        Ok(self)
    }
}

/// A generic controller: runs the informer, waits for the cache to sync and
/// dispatches every observed change to the handler through the work queue.
pub struct Controller<K: ResourceObject> {
    inner: Arc<Inner<K>>,
}

impl<K: ResourceObject> std::fmt::Debug for Controller<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.inner.name)
            .finish()
    }
}

struct Inner<K: ResourceObject> {
    name: String,
    queue: Arc<WorkQueue>,
    informer: Arc<Informer<K>>,
    processor: RetryProcessor<IndexerProcessor<K>>,
    metrics: Arc<dyn MetricsRecorder>,
    leader_elector: Option<Arc<dyn LeaderElector>>,
    concurrent_workers: usize,
    running: Mutex<bool>,
}

/// Enqueues informer notifications, tagging the queued-event metric.
struct QueueingEventHandler {
    name: String,
    queue: Arc<WorkQueue>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl<K: ResourceObject> EventHandler<K> for QueueingEventHandler {
    fn on_add(&self, obj: &K) {
        self.queue.add(obj.object_key());
        self.metrics.queued_event(&self.name, false);
    }

    fn on_update(&self, _old: &K, new: &K) {
        self.queue.add(new.object_key());
        self.metrics.queued_event(&self.name, false);
    }

    fn on_delete(&self, obj: &DeletedObject<K>) {
        self.queue.add(obj.object_key());
        self.metrics.queued_event(&self.name, false);
    }
}

impl<K: ResourceObject> Controller<K> {
    /// Validate `cfg` and assemble a controller.
    pub fn new(cfg: Config<K>) -> Result<Self, Error> {
        let cfg = cfg.validated()?;
        let queue = WorkQueue::new();

        let informer = Arc::new(Informer::new(
            cfg.retriever,
            Arc::new(QueueingEventHandler {
                name: cfg.name.clone(),
                queue: Arc::clone(&queue),
                metrics: Arc::clone(&cfg.metrics),
            }),
            cfg.resync_interval,
            cfg.list_options,
        ));

        cfg.metrics.register_queue_length(&cfg.name, {
            let queue = Arc::clone(&queue);
            Box::new(move || queue.len())
        });

        let retries = cfg
            .processing_job_retries
            .unwrap_or(DEFAULT_PROCESSING_JOB_RETRIES);
        let processor = RetryProcessor::new(
            cfg.name.clone(),
            retries,
            Arc::clone(&queue),
            Arc::clone(&cfg.metrics),
            IndexerProcessor::new(informer.store(), cfg.handler),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                name: cfg.name,
                queue,
                informer,
                processor,
                metrics: cfg.metrics,
                leader_elector: cfg.leader_elector,
                concurrent_workers: cfg.concurrent_workers,
                running: Mutex::new(false),
            }),
        })
    }

    /// A read handle onto the controller's object cache.
    pub fn store(&self) -> Store<K> {
        self.inner.informer.store()
    }

    /// Run the controller until `ctx` is cancelled.
    ///
    /// Blocks while running. With a leader elector configured, blocks until
    /// leadership is acquired first, and returns
    /// [`Error::LeadershipLost`] if the lease is lost while running.
    pub async fn run(&self, ctx: &CancellationToken) -> Result<(), Error> {
        {
            let mut running = self.inner.running.lock();
            if *running {
                return Err(Error::AlreadyRunning);
            }
            *running = true;
        }

        let result = match &self.inner.leader_elector {
            Some(elector) => {
                let body = Box::pin(Arc::clone(&self.inner).run_pipeline(ctx.clone()));
                elector.run(ctx, body).await
            }
            None => Arc::clone(&self.inner).run_pipeline(ctx.clone()).await,
        };

        *self.inner.running.lock() = false;
        result
    }
}

impl<K: ResourceObject> Inner<K> {
    async fn run_pipeline(self: Arc<Self>, ctx: CancellationToken) -> Result<(), Error> {
        info!(controller = %self.name, "starting controller");

        let informer_task = tokio::spawn({
            let informer = Arc::clone(&self.informer);
            let ctx = ctx.clone();
            async move { informer.run(&ctx).await }
        });

        tokio::select! {
            _ = ctx.cancelled() => {
                let _ = informer_task.await;
                return Err(Error::SyncTimeout);
            }
            synced = self.informer.wait_for_sync() => {
                synced.map_err(|err| Error::CacheSyncFailed(err.to_string()))?;
            }
        }
        debug!(controller = %self.name, "cache synced");

        let workers: Vec<_> = (0..self.concurrent_workers)
            .map(|worker| {
                tokio::spawn(Arc::clone(&self).supervise_worker(ctx.clone(), worker))
            })
            .collect();

        ctx.cancelled().await;
        info!(controller = %self.name, "stopping controller");

        self.queue.shut_down();
        for worker in workers {
            let _ = worker.await;
        }
        let _ = informer_task.await;
        Ok(())
    }

    /// Keep one worker slot alive: a panicking worker is logged and
    /// replaced after a short delay so a single bad handler cannot take
    /// the controller down.
    async fn supervise_worker(self: Arc<Self>, ctx: CancellationToken, worker: usize) {
        loop {
            let run = tokio::spawn(Arc::clone(&self).worker_loop(ctx.clone()));
            match run.await {
                Ok(()) => return,
                Err(err) if err.is_panic() => {
                    error!(
                        controller = %self.name,
                        worker,
                        "worker panicked, restarting"
                    );
                    tokio::select! {
                        _ = ctx.cancelled() => return,
                        _ = tokio::time::sleep(WORKER_RESTART_DELAY) => {}
                    }
                }
                Err(_) => return,
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, ctx: CancellationToken) {
        while let Some((key, queued_at)) = self.queue.get().await {
            self.metrics.in_queue_duration(&self.name, queued_at);
            let started_at = Instant::now();
            let result = self.processor.process(&ctx, &key).await;
            self.queue.done(&key);
            self.metrics
                .processing_duration(&self.name, result.is_ok(), started_at);

            match result {
                Ok(()) => {}
                Err(err) if err.is_requeued() => {
                    warn!(controller = %self.name, %key, error = %err, "error processing job (requeued)");
                }
                Err(err) => {
                    error!(
                        controller = %self.name,
                        %key,
                        error = %err,
                        "error processing job, retry budget exhausted, dropping"
                    );
                }
            }
        }
    }
}
