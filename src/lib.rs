//! Generic controller runtime for reconciling declaratively-described
//! resources against a remote cluster-style API.
//!
//! The runtime is a reusable engine: given a [`Retriever`] (how to list and
//! watch a resource class), a [`Handler`] (how to reconcile a single
//! resource) and a [`Config`], it delivers at-least-once change
//! notifications for every observed resource to the handler, with bounded
//! concurrency, rate-limited retries, optional single-leader gating, resync
//! sweeps and observable metrics.
//!
//! The moving parts, in data-flow order: a retriever feeds an
//! [`Informer`](informer::Informer) which maintains a key→object
//! [`Store`](store::Store) and enqueues object keys on a deduplicating
//! [`WorkQueue`](queue::WorkQueue); a pool of workers dequeues keys,
//! resolves them against the store and dispatches them to the handler,
//! re-enqueueing with backoff on failure. [`Controller::run`] wires all of
//! it together.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod controller;
pub mod handler;
pub mod informer;
pub mod leader;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod rate_limit;
pub mod resource;
pub mod retriever;
pub mod store;
pub mod testing;

pub use controller::{Config, Controller, Error};
pub use handler::Handler;
pub use resource::{ObjectKey, ResourceObject};
pub use retriever::{Event, ListOptions, MultiRetriever, ObjectList, Retriever, WatchStream};

/// Type-erased error returned by user-supplied handlers and collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
