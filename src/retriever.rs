//! How a controller retrieves resources and resource events from the
//! remote API.
//!
//! A [`Retriever`] is bound to a single resource class and provides a
//! snapshot [`list`](Retriever::list) plus a change-stream
//! [`watch`](Retriever::watch). [`MultiRetriever`] composes several
//! retrievers into one logical source so a controller can react to updates
//! on multiple classes.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use crate::resource::ResourceObject;
use crate::BoxError;

/// Buffer size of the channel behind a [`WatchStream`].
const WATCH_BUFFER: usize = 128;

/// Options applied to list and watch requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Restrict the returned objects by their labels. Everything if `None`.
    pub label_selector: Option<String>,
    /// Restrict the returned objects by their fields. Everything if `None`.
    pub field_selector: Option<String>,
    /// Resource version to resume a watch from. A watch started with `None`
    /// begins at the remote API's discretion.
    pub resource_version: Option<String>,
}

impl ListOptions {
    /// Configure the label selector.
    #[must_use]
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_owned());
        self
    }

    /// Configure the field selector.
    #[must_use]
    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_owned());
        self
    }
}

/// A complete snapshot of a resource class.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    /// Version of the collection at snapshot time; a subsequent watch
    /// should resume from here. `None` when unknown (e.g. merged lists).
    pub resource_version: Option<String>,
    /// The objects.
    pub items: Vec<K>,
}

/// A single change observed on the watch stream.
#[derive(Debug, Clone)]
pub enum Event<K> {
    /// An object appeared.
    Added(K),
    /// An object changed.
    Modified(K),
    /// An object disappeared.
    Deleted(K),
    /// Watch progress marker; carries the version the stream has reached.
    Bookmark {
        /// Version the stream has caught up to.
        resource_version: String,
    },
    /// The remote API reported a stream-level problem. The informer reacts
    /// by relisting and rewatching.
    Error(StreamError),
}

/// Stream-level error reported by the remote API inside a watch.
#[derive(Debug, Clone, Error)]
#[error("watch stream error: {message}")]
pub struct StreamError {
    /// Human-readable description from the remote API.
    pub message: String,
    /// Status code, when the remote API provided one.
    pub code: Option<u16>,
}

/// Error performing a list or watch request.
#[derive(Debug, Error)]
#[error("retrieve request failed")]
pub struct RetrieveError {
    #[source]
    source: BoxError,
}

impl RetrieveError {
    /// Wrap an underlying transport or API error.
    pub fn new<E: Into<BoxError>>(source: E) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Wrap a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            source: message.into().into(),
        }
    }
}

/// Abstract source of a single resource class.
///
/// Failures from [`list`](Self::list) are fatal to cache sync; failures
/// from [`watch`](Self::watch) are recoverable, the informer relists and
/// rewatches with backoff. The runtime holds a retriever as a pure
/// dependency and never mutates it.
#[async_trait]
pub trait Retriever<K: ResourceObject>: Send + Sync {
    /// Return a complete snapshot of the resource class.
    async fn list(&self, opts: &ListOptions) -> Result<ObjectList<K>, RetrieveError>;

    /// Open a lazy, possibly-infinite stream of change events, starting
    /// from `opts.resource_version`.
    async fn watch(&self, opts: &ListOptions) -> Result<WatchStream<K>, RetrieveError>;
}

/// A cancellable stream of watch [`Event`]s.
///
/// Backed by a bounded channel: retriever implementations obtain the
/// producing half from [`WatchStream::channel`] and feed it from their own
/// tasks. [`stop`](Self::stop) is idempotent and safe to call
/// concurrently; dropping the stream stops it as well. After a stop the
/// already-buffered events drain and the stream then yields `None`.
pub struct WatchStream<K> {
    rx: mpsc::Receiver<Event<K>>,
    stop: CancellationToken,
}

impl<K> WatchStream<K> {
    /// Create a connected producer/stream pair.
    pub fn channel() -> (WatchSender<K>, WatchStream<K>) {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let stop = CancellationToken::new();
        (
            WatchSender {
                tx,
                stop: stop.clone(),
            },
            WatchStream { rx, stop },
        )
    }

    /// Stop the stream, releasing all resources held by its producers.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether [`stop`](Self::stop) has been observed.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl<K> Drop for WatchStream<K> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl<K> Stream for WatchStream<K> {
    type Item = Event<K>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Producing half of a [`WatchStream`].
///
/// Cloneable so several tasks can feed the same stream. Sends fail once the
/// stream has been stopped or dropped.
pub struct WatchSender<K> {
    tx: mpsc::Sender<Event<K>>,
    stop: CancellationToken,
}

impl<K> Clone for WatchSender<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stop: self.stop.clone(),
        }
    }
}

/// The connected [`WatchStream`] is no longer accepting events.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("watch stream closed")]
pub struct WatchClosed;

impl<K> WatchSender<K> {
    /// Deliver an event, waiting for buffer space if necessary.
    pub async fn send(&self, event: Event<K>) -> Result<(), WatchClosed> {
        tokio::select! {
            _ = self.stop.cancelled() => Err(WatchClosed),
            sent = self.tx.send(event) => sent.map_err(|_| WatchClosed),
        }
    }

    /// Resolves when the consumer stops the stream.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.stop.cancelled()
    }

    /// Whether the consumer has stopped the stream.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// Fan-in of several retrievers into one logical resource source.
///
/// `list` concatenates every child snapshot, `watch` merges every child
/// stream into a single output in arrival order. Objects from different
/// children may share key spaces; callers are responsible for keys being
/// globally unique across children.
pub struct MultiRetriever<K> {
    retrievers: Vec<Arc<dyn Retriever<K>>>,
}

impl<K: ResourceObject> MultiRetriever<K> {
    /// Compose `retrievers`. At least one is required.
    pub fn new(retrievers: Vec<Arc<dyn Retriever<K>>>) -> Result<Self, RetrieveError> {
        if retrievers.is_empty() {
            return Err(RetrieveError::msg("at least one retriever is required"));
        }
        Ok(Self { retrievers })
    }
}

#[async_trait]
impl<K: ResourceObject> Retriever<K> for MultiRetriever<K> {
    async fn list(&self, opts: &ListOptions) -> Result<ObjectList<K>, RetrieveError> {
        let mut items = Vec::new();
        for retriever in &self.retrievers {
            items.extend(retriever.list(opts).await?.items);
        }
        // Children resume their watches from their own versions, so the
        // merged snapshot carries none.
        Ok(ObjectList {
            resource_version: None,
            items,
        })
    }

    async fn watch(&self, opts: &ListOptions) -> Result<WatchStream<K>, RetrieveError> {
        let mut children = Vec::with_capacity(self.retrievers.len());
        for retriever in &self.retrievers {
            match retriever.watch(opts).await {
                Ok(stream) => children.push(stream),
                Err(err) => {
                    for child in &children {
                        child.stop();
                    }
                    return Err(err);
                }
            }
        }

        let (tx, merged) = WatchStream::channel();
        for mut child in children {
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tx.stopped() => {
                            child.stop();
                            break;
                        }
                        event = child.next() => match event {
                            Some(event) => {
                                if tx.send(event).await.is_err() {
                                    child.stop();
                                    break;
                                }
                            }
                            // Child closed on its own; exit silently, the
                            // merged stream stays open until stop().
                            None => break,
                        },
                    }
                }
            });
        }
        // Park the original sender until stop() so the merged stream has a
        // predictable lifetime even after every child has closed.
        tokio::spawn(async move {
            tx.stopped().await;
            debug!("merged watch stopped");
        });
        Ok(merged)
    }
}
