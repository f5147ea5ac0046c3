//! Test doubles for controller wiring: a scripted retriever, recording
//! handlers and an in-memory lease store.
//!
//! These are real implementations of the public traits, useful both for
//! this crate's own tests and for consumers exercising their handlers
//! without a remote API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::handler::Handler;
use crate::leader::{CommitError, LeaseLock, LeaseRecord};
use crate::resource::{ObjectKey, ResourceObject};
use crate::retriever::{
    Event, ListOptions, ObjectList, RetrieveError, Retriever, WatchSender, WatchStream,
};
use crate::BoxError;

/// A minimal [`ResourceObject`] for tests and examples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestObject {
    kind: String,
    namespace: Option<String>,
    name: String,
    resource_version: Option<String>,
}

impl TestObject {
    /// A cluster-scoped object.
    pub fn cluster_scoped(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: None,
            name: name.into(),
            resource_version: None,
        }
    }

    /// A namespaced object.
    pub fn namespaced(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
            resource_version: None,
        }
    }

    /// Attach a resource version.
    #[must_use]
    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = Some(version.into());
        self
    }
}

impl ResourceObject for TestObject {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }
}

/// Scripted [`Retriever`]: lists a configurable snapshot and exposes every
/// open watch so tests can steer the event stream.
pub struct FixtureRetriever<K> {
    items: Mutex<Vec<K>>,
    list_error: Option<String>,
    list_calls: AtomicUsize,
    watchers: Mutex<Vec<WatchSender<K>>>,
}

impl<K: ResourceObject> FixtureRetriever<K> {
    /// Retriever whose `list` returns `items`.
    pub fn new(items: Vec<K>) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(items),
            list_error: None,
            list_calls: AtomicUsize::new(0),
            watchers: Mutex::new(Vec::new()),
        })
    }

    /// Retriever whose `list` always fails with `message`.
    pub fn failing_list(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(Vec::new()),
            list_error: Some(message.into()),
            list_calls: AtomicUsize::new(0),
            watchers: Mutex::new(Vec::new()),
        })
    }

    /// Replace the snapshot returned by subsequent `list` calls.
    pub fn set_items(&self, items: Vec<K>) {
        *self.items.lock() = items;
    }

    /// How many times `list` was called.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of watch streams that are still open.
    pub fn open_watches(&self) -> usize {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| !w.is_stopped());
        watchers.len()
    }

    /// Deliver `event` to every open watch stream.
    pub async fn emit(&self, event: Event<K>) {
        let watchers: Vec<_> = {
            let mut guard = self.watchers.lock();
            guard.retain(|w| !w.is_stopped());
            guard.clone()
        };
        for watcher in watchers {
            let _ = watcher.send(event.clone()).await;
        }
    }
}

#[async_trait]
impl<K: ResourceObject> Retriever<K> for FixtureRetriever<K> {
    async fn list(&self, _opts: &ListOptions) -> Result<ObjectList<K>, RetrieveError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.list_error {
            return Err(RetrieveError::msg(message.clone()));
        }
        Ok(ObjectList {
            resource_version: Some(self.list_calls().to_string()),
            items: self.items.lock().clone(),
        })
    }

    async fn watch(&self, _opts: &ListOptions) -> Result<WatchStream<K>, RetrieveError> {
        let (tx, stream) = WatchStream::channel();
        self.watchers.lock().push(tx);
        Ok(stream)
    }
}

/// [`Handler`] that records every call, optionally failing or sleeping.
pub struct RecordingHandler {
    adds: Mutex<Vec<ObjectKey>>,
    deletes: Mutex<Vec<ObjectKey>>,
    fail: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingHandler {
    /// Handler that succeeds immediately.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            adds: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            fail: false,
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Handler that fails every call.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            adds: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Handler that sleeps `delay` inside every call.
    pub fn sleeping(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            adds: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            fail: false,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Keys passed to `add`, in call order.
    pub fn adds(&self) -> Vec<ObjectKey> {
        self.adds.lock().clone()
    }

    /// Keys passed to `delete`, in call order.
    pub fn deletes(&self) -> Vec<ObjectKey> {
        self.deletes.lock().clone()
    }

    /// Total calls across `add` and `delete`.
    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The largest number of calls that were ever in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn observe(&self, recorded: &Mutex<Vec<ObjectKey>>, key: ObjectKey) -> Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);
        recorded.lock().push(key.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(format!("handler rigged to fail for {key}").into());
        }
        Ok(())
    }
}

#[async_trait]
impl<K: ResourceObject> Handler<K> for RecordingHandler {
    async fn add(&self, _ctx: &CancellationToken, obj: Arc<K>) -> Result<(), BoxError> {
        self.observe(&self.adds, obj.object_key()).await
    }

    async fn delete(&self, _ctx: &CancellationToken, key: &ObjectKey) -> Result<(), BoxError> {
        self.observe(&self.deletes, key.clone()).await
    }
}

/// In-memory [`LeaseLock`], for exercising leader election without a
/// remote API. Electors sharing a clone of the same lock compete for the
/// same lease.
#[derive(Default)]
pub struct InMemoryLeaseLock {
    record: Mutex<Option<LeaseRecord>>,
}

#[async_trait]
impl LeaseLock for InMemoryLeaseLock {
    async fn get(&self) -> Result<Option<LeaseRecord>, BoxError> {
        Ok(self.record.lock().clone())
    }

    async fn commit(&self, mut record: LeaseRecord) -> Result<LeaseRecord, CommitError> {
        let mut stored = self.record.lock();
        let current_version = stored.as_ref().map_or(0, |r| r.version);
        if record.version != current_version {
            return Err(CommitError::Conflict);
        }
        record.version += 1;
        *stored = Some(record.clone());
        Ok(record)
    }
}
