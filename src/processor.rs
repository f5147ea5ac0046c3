//! Turns a dequeued key into a handler call, with retries layered on top.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::handler::Handler;
use crate::metrics::MetricsRecorder;
use crate::queue::WorkQueue;
use crate::resource::{ObjectKey, ResourceObject};
use crate::store::Store;
use crate::BoxError;

/// Processing failed for a key.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The handler returned an error.
    #[error("handler failed processing {key}")]
    Handler {
        /// Key being processed.
        key: ObjectKey,
        /// The handler's error.
        #[source]
        source: BoxError,
    },
    /// The handler panicked. Treated as a failure for the event: it
    /// consumes the retry budget like any other error.
    #[error("handler panicked processing {key}: {message}")]
    HandlerPanic {
        /// Key being processed.
        key: ObjectKey,
        /// Rendered panic payload.
        message: String,
    },
    /// The key was re-enqueued with backoff after a failure; informational
    /// for the worker, which logs it at warning level.
    #[error("{key} requeued after processing error")]
    Requeued {
        /// Key that was re-enqueued.
        key: ObjectKey,
        /// The failure that caused the requeue.
        #[source]
        source: Box<ProcessError>,
    },
}

impl ProcessError {
    /// Whether this failure was absorbed by scheduling a retry.
    pub fn is_requeued(&self) -> bool {
        matches!(self, ProcessError::Requeued { .. })
    }
}

/// Processes object keys dequeued by the worker pool.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process a single key.
    async fn process(&self, ctx: &CancellationToken, key: &ObjectKey) -> Result<(), ProcessError>;
}

/// Resolves keys against the cache and dispatches to the handler: a cached
/// object is reconciled through [`Handler::add`], a missing one through
/// [`Handler::delete`].
pub struct IndexerProcessor<K: ResourceObject> {
    store: Store<K>,
    handler: Arc<dyn Handler<K>>,
}

impl<K: ResourceObject> IndexerProcessor<K> {
    /// Processor over `store` dispatching to `handler`.
    pub fn new(store: Store<K>, handler: Arc<dyn Handler<K>>) -> Self {
        Self { store, handler }
    }
}

#[async_trait]
impl<K: ResourceObject> Processor for IndexerProcessor<K> {
    async fn process(&self, ctx: &CancellationToken, key: &ObjectKey) -> Result<(), ProcessError> {
        let call = match self.store.get(key) {
            Some(obj) => AssertUnwindSafe(self.handler.add(ctx, obj)).catch_unwind().await,
            None => AssertUnwindSafe(self.handler.delete(ctx, key)).catch_unwind().await,
        };
        match call {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(ProcessError::Handler {
                key: key.clone(),
                source,
            }),
            Err(panic) => Err(ProcessError::HandlerPanic {
                key: key.clone(),
                message: panic_message(&panic),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Wraps a processor with the per-key retry policy.
///
/// A failing key is re-enqueued with backoff while it has budget left
/// (reported as [`ProcessError::Requeued`]); once the budget is exhausted,
/// or on success, the key's backoff state is forgotten.
pub struct RetryProcessor<P> {
    name: String,
    max_retries: usize,
    queue: Arc<WorkQueue>,
    metrics: Arc<dyn MetricsRecorder>,
    inner: P,
}

impl<P: Processor> RetryProcessor<P> {
    /// Retry wrapper for controller `name` with a budget of `max_retries`
    /// re-deliveries per key.
    pub fn new(
        name: impl Into<String>,
        max_retries: usize,
        queue: Arc<WorkQueue>,
        metrics: Arc<dyn MetricsRecorder>,
        inner: P,
    ) -> Self {
        Self {
            name: name.into(),
            max_retries,
            queue,
            metrics,
            inner,
        }
    }
}

#[async_trait]
impl<P: Processor> Processor for RetryProcessor<P> {
    async fn process(&self, ctx: &CancellationToken, key: &ObjectKey) -> Result<(), ProcessError> {
        let err = match self.inner.process(ctx, key).await {
            Ok(()) => {
                self.queue.forget(key);
                return Ok(());
            }
            Err(err) => err,
        };

        if self.queue.num_requeues(key) < self.max_retries {
            self.queue.add_rate_limited(key.clone());
            self.metrics.queued_event(&self.name, true);
            return Err(ProcessError::Requeued {
                key: key.clone(),
                source: Box::new(err),
            });
        }

        self.queue.forget(key);
        Err(err)
    }
}
