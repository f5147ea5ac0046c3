//! Bridges a retriever's list+watch into the cache and a notification sink.
//!
//! The informer lists the resource class, swaps the snapshot into the
//! [`StoreWriter`], then follows the watch stream, keeping the cache
//! current and emitting add/update/delete notifications. Watch disconnects
//! are recovered internally by relisting with backoff; consumers only see
//! the notifications and the sync latch.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::resource::{ObjectKey, ResourceObject};
use crate::retriever::{Event, ListOptions, Retriever};
use crate::store::{Store, StoreWriter};

const RELIST_BACKOFF_INITIAL: Duration = Duration::from_millis(800);
const RELIST_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Receives cache-change notifications from an [`Informer`].
///
/// Callbacks are synchronous and must be cheap; the controller's
/// implementation just enqueues the object key.
pub trait EventHandler<K>: Send + Sync {
    /// First observation of the object's key since cache start.
    fn on_add(&self, obj: &K);

    /// The object changed (its resource version moved), or a resync tick
    /// replayed it.
    fn on_update(&self, old: &K, new: &K);

    /// The object disappeared, observed directly or inferred across a
    /// relist.
    fn on_delete(&self, obj: &DeletedObject<K>);
}

/// A deletion notification.
///
/// Deletions observed on the watch carry the final object state; deletions
/// inferred across a relist only carry a tombstone.
pub enum DeletedObject<K> {
    /// The final state of the deleted object.
    Final(K),
    /// The object vanished while the watch was disconnected.
    Tombstone {
        /// Key of the vanished object.
        key: ObjectKey,
        /// Its state before the watch was interrupted.
        last_known: Arc<K>,
    },
}

impl<K: ResourceObject> DeletedObject<K> {
    /// Deletion-aware key extraction: unwraps tombstones.
    pub fn object_key(&self) -> ObjectKey {
        match self {
            DeletedObject::Final(obj) => obj.object_key(),
            DeletedObject::Tombstone { key, .. } => key.clone(),
        }
    }

    /// The last state the informer saw for the object.
    pub fn last_known(&self) -> &K {
        match self {
            DeletedObject::Final(obj) => obj,
            DeletedObject::Tombstone { last_known, .. } => last_known,
        }
    }
}

/// The initial list failed; the cache can never sync.
#[derive(Debug, Clone, Error)]
#[error("cache sync failed: {reason}")]
pub struct CacheSyncError {
    reason: String,
}

#[derive(Clone, Debug)]
enum SyncState {
    Pending,
    Synced,
    Failed(String),
}

/// Maintains the cache from a retriever and notifies an [`EventHandler`].
pub struct Informer<K: ResourceObject> {
    retriever: Arc<dyn Retriever<K>>,
    handler: Arc<dyn EventHandler<K>>,
    writer: Mutex<StoreWriter<K>>,
    reader: Store<K>,
    opts: ListOptions,
    resync_interval: Duration,
    sync_tx: watch::Sender<SyncState>,
    sync_rx: watch::Receiver<SyncState>,
}

#[derive(Debug, Error)]
enum WatchCycleError {
    #[error("list failed")]
    List(#[source] crate::retriever::RetrieveError),
    #[error("watch failed to start")]
    Watch(#[source] crate::retriever::RetrieveError),
    #[error("watch stream reported an error")]
    Stream(#[source] crate::retriever::StreamError),
    #[error("watch stream disconnected")]
    Disconnected,
}

impl<K: ResourceObject> Informer<K> {
    /// Informer over `retriever`, notifying `handler` and resyncing the
    /// whole cache every `resync_interval`.
    pub fn new(
        retriever: Arc<dyn Retriever<K>>,
        handler: Arc<dyn EventHandler<K>>,
        resync_interval: Duration,
        opts: ListOptions,
    ) -> Self {
        let writer = StoreWriter::default();
        let reader = writer.as_reader();
        let (sync_tx, sync_rx) = watch::channel(SyncState::Pending);
        Self {
            retriever,
            handler,
            writer: Mutex::new(writer),
            reader,
            opts,
            resync_interval,
            sync_tx,
            sync_rx,
        }
    }

    /// A read handle onto the cache.
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Whether the initial list has been applied to the cache.
    pub fn has_synced(&self) -> bool {
        matches!(*self.sync_rx.borrow(), SyncState::Synced)
    }

    /// Wait until the cache has synced, or report that it never will.
    pub async fn wait_for_sync(&self) -> Result<(), CacheSyncError> {
        let mut rx = self.sync_rx.clone();
        let state = rx
            .wait_for(|state| !matches!(state, SyncState::Pending))
            .await
            .map_err(|_| CacheSyncError {
                reason: "informer stopped before the cache synced".to_owned(),
            })?;
        match &*state {
            SyncState::Failed(reason) => Err(CacheSyncError {
                reason: reason.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Drive list+watch until `ctx` is cancelled.
    ///
    /// A failure of the initial list is fatal and reported through
    /// [`wait_for_sync`](Self::wait_for_sync); later failures relist with
    /// backoff.
    pub async fn run(&self, ctx: &CancellationToken) {
        let mut relist_backoff = relist_backoff();
        loop {
            // Cancellation wins even while a list or watch call blocks;
            // dropping the cycle future releases its stream.
            let err = tokio::select! {
                _ = ctx.cancelled() => return,
                err = self.list_and_watch(&mut relist_backoff) => err,
            };
            if matches!(err, WatchCycleError::List(_)) && !self.has_synced() {
                // The cache will never reflect a completed list; the
                // controller run must fail.
                warn!(error = %err, "initial list failed");
                self.sync_tx
                    .send_replace(SyncState::Failed(err.to_string()));
                return;
            }
            let pause = relist_backoff.next_backoff().unwrap_or(RELIST_BACKOFF_MAX);
            warn!(error = %err, backoff = ?pause, "watch interrupted, relisting");
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// One list+watch cycle; runs until the watch fails.
    async fn list_and_watch(&self, relist_backoff: &mut ExponentialBackoff) -> WatchCycleError {
        let list = match self.retriever.list(&self.opts).await {
            Ok(list) => list,
            Err(err) => return WatchCycleError::List(err),
        };
        relist_backoff.reset();
        debug!(items = list.items.len(), "list complete");

        let outcome = self.writer.lock().replace(&list.items);
        for obj in &outcome.added {
            self.handler.on_add(obj);
        }
        for (old, new) in &outcome.updated {
            self.notify_update(old, new);
        }
        for (key, last_known) in outcome.deleted {
            self.handler.on_delete(&DeletedObject::Tombstone {
                key,
                last_known,
            });
        }
        self.sync_tx.send_replace(SyncState::Synced);

        let mut watch_opts = self.opts.clone();
        watch_opts.resource_version = list.resource_version;
        let mut stream = match self.retriever.watch(&watch_opts).await {
            Ok(stream) => stream,
            Err(err) => return WatchCycleError::Watch(err),
        };

        let mut resync = interval_at(
            Instant::now() + self.resync_interval,
            self.resync_interval,
        );
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = resync.tick() => self.resync(),
                event = stream.next() => match event {
                    None => return WatchCycleError::Disconnected,
                    Some(Event::Added(obj)) | Some(Event::Modified(obj)) => {
                        let prev = self.writer.lock().apply(&obj);
                        match prev {
                            None => self.handler.on_add(&obj),
                            Some(old) => self.notify_update(&old, &obj),
                        }
                    }
                    Some(Event::Deleted(obj)) => {
                        self.writer.lock().remove(&obj.object_key());
                        self.handler.on_delete(&DeletedObject::Final(obj));
                    }
                    Some(Event::Bookmark { resource_version }) => {
                        debug!(resource_version, "watch bookmark");
                    }
                    Some(Event::Error(err)) => {
                        stream.stop();
                        return WatchCycleError::Stream(err);
                    }
                },
            }
        }
    }

    /// Replay the whole cache as updates so handlers observe drift.
    fn resync(&self) {
        let state = self.reader.state();
        debug!(items = state.len(), "resync sweep");
        for obj in state {
            self.handler.on_update(&obj, &obj);
        }
    }

    fn notify_update(&self, old: &K, new: &K) {
        // Unchanged versions are skipped; resync replays go through
        // resync() directly.
        match (old.resource_version(), new.resource_version()) {
            (Some(old_rv), Some(new_rv)) if old_rv == new_rv => {}
            _ => self.handler.on_update(old, new),
        }
    }
}

fn relist_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(RELIST_BACKOFF_INITIAL)
        .with_max_interval(RELIST_BACKOFF_MAX)
        .with_max_elapsed_time(None)
        .build()
}
