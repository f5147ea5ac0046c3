//! Single-writer gating through a remote lease.
//!
//! The elector is a decorator around the controller loop: it campaigns for
//! a named, namespaced lease, invokes the gated body exactly once after
//! acquiring it, keeps the lease renewed while the body runs, and reports
//! [`Error::LeadershipLost`] if the lease slips away. Lease storage is
//! behind the [`LeaseLock`] boundary so any compare-and-swap-capable remote
//! API can host the lease.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::Error;
use crate::BoxError;

/// Gates a controller body behind leadership.
///
/// `run` blocks until this instance acquires leadership, then invokes
/// `body` exactly once. If leadership is lost while the body runs, `run`
/// resolves to [`Error::LeadershipLost`]. If `ctx` is cancelled before
/// leadership was ever acquired, `run` resolves to `Ok(())` without
/// invoking the body.
#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Run `body` while holding leadership.
    async fn run<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        body: BoxFuture<'a, Result<(), Error>>,
    ) -> Result<(), Error>;
}

/// Lease timing parameters.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long a lease is valid after its last renewal.
    pub lease_duration: Duration,
    /// How long the holder keeps trying to renew before giving up
    /// leadership.
    pub renew_deadline: Duration,
    /// Pause between acquisition and renewal attempts.
    pub retry_period: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// A lease as stored by a [`LeaseLock`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Identity of the current holder, if any.
    pub holder: Option<String>,
    /// When the current holder first acquired the lease.
    pub acquire_time: Option<DateTime<Utc>>,
    /// When the lease was last renewed.
    pub renew_time: Option<DateTime<Utc>>,
    /// Validity window after `renew_time`, in milliseconds.
    pub lease_duration_millis: i64,
    /// Number of times the lease changed hands.
    pub transitions: u32,
    /// Storage version for optimistic concurrency; `0` for a record that
    /// was never committed.
    pub version: u64,
}

impl LeaseRecord {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.renew_time
            .map(|renewed| renewed + chrono::Duration::milliseconds(self.lease_duration_millis))
    }
}

/// Committing a lease record failed.
#[derive(Debug, Error)]
pub enum CommitError {
    /// Another writer committed first; re-read and retry.
    #[error("lease was modified concurrently")]
    Conflict,
    /// The lease store itself failed.
    #[error("lease store error")]
    Store(#[source] BoxError),
}

/// Storage for a single named, namespaced lease.
///
/// One instance corresponds to one lease object; electors sharing a lock
/// compete for the same lease. `commit` must be atomic: it replaces the
/// record only if `record.version` still matches the stored version
/// (`0` matches "not present"), and fails with
/// [`CommitError::Conflict`] otherwise.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Read the current record, if one was ever committed.
    async fn get(&self) -> Result<Option<LeaseRecord>, BoxError>;

    /// Compare-and-swap the record. On success the committed record is
    /// returned with its new version.
    async fn commit(&self, record: LeaseRecord) -> Result<LeaseRecord, CommitError>;
}

enum AcquireAttempt {
    Acquired,
    HeldByOther { holder: String },
    LostRace,
}

/// Lease-backed [`LeaderElector`].
pub struct LeaseElector {
    name: String,
    namespace: String,
    identity: String,
    lock: std::sync::Arc<dyn LeaseLock>,
    cfg: LeaseConfig,
}

impl LeaseElector {
    /// Elector campaigning for the lease `name` in `namespace` through
    /// `lock`. Both identifiers must be non-empty.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        lock: std::sync::Arc<dyn LeaseLock>,
        cfg: LeaseConfig,
    ) -> Result<Self, Error> {
        let name = name.into();
        let namespace = namespace.into();
        if name.is_empty() {
            return Err(Error::InvalidConfiguration(
                "leader election requires a lease name".to_owned(),
            ));
        }
        if namespace.is_empty() {
            return Err(Error::InvalidConfiguration(
                "leader election requires a namespace".to_owned(),
            ));
        }
        Ok(Self {
            identity: instance_identity(),
            name,
            namespace,
            lock,
            cfg,
        })
    }

    /// The identity this instance holds the lease under.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// One acquisition or renewal attempt against the lease store.
    async fn try_acquire(&self, now: DateTime<Utc>) -> Result<AcquireAttempt, BoxError> {
        let mut record = self.lock.get().await?.unwrap_or_default();

        let held_by_self = record.holder.as_deref() == Some(self.identity.as_str());
        if let (Some(holder), Some(expires_at)) = (&record.holder, record.expires_at()) {
            if !held_by_self && expires_at > now {
                return Ok(AcquireAttempt::HeldByOther {
                    holder: holder.clone(),
                });
            }
        }

        if !held_by_self {
            record.holder = Some(self.identity.clone());
            record.acquire_time = Some(now);
            record.transitions += 1;
        }
        record.renew_time = Some(now);
        record.lease_duration_millis = self.cfg.lease_duration.as_millis() as i64;

        match self.lock.commit(record).await {
            Ok(_) => Ok(AcquireAttempt::Acquired),
            Err(CommitError::Conflict) => Ok(AcquireAttempt::LostRace),
            Err(CommitError::Store(err)) => Err(err),
        }
    }

    /// Campaign until the lease is acquired or `ctx` is cancelled.
    /// Resolves to `false` when cancelled first.
    async fn campaign(&self, ctx: &CancellationToken) -> bool {
        loop {
            if ctx.is_cancelled() {
                return false;
            }
            match self.try_acquire(Utc::now()).await {
                Ok(AcquireAttempt::Acquired) => return true,
                Ok(AcquireAttempt::HeldByOther { holder }) => {
                    debug!(lease = %self.name, %holder, "lease held, waiting");
                }
                Ok(AcquireAttempt::LostRace) => {}
                Err(err) => {
                    warn!(lease = %self.name, error = %err, "lease acquisition attempt failed");
                }
            }
            tokio::select! {
                _ = ctx.cancelled() => return false,
                _ = sleep(self.cfg.retry_period) => {}
            }
        }
    }

    /// Keep the lease renewed; resolves once leadership is lost.
    async fn keep_renewed(&self) -> Error {
        let mut last_renewal = Instant::now();
        loop {
            sleep(self.cfg.retry_period).await;
            match self.try_acquire(Utc::now()).await {
                Ok(AcquireAttempt::Acquired) => last_renewal = Instant::now(),
                Ok(AcquireAttempt::HeldByOther { holder }) => {
                    warn!(lease = %self.name, %holder, "lease taken over");
                    return Error::LeadershipLost;
                }
                Ok(AcquireAttempt::LostRace) => {}
                Err(err) => {
                    warn!(lease = %self.name, error = %err, "lease renewal attempt failed");
                }
            }
            if last_renewal.elapsed() > self.cfg.renew_deadline {
                warn!(lease = %self.name, "failed to renew lease within the deadline");
                return Error::LeadershipLost;
            }
        }
    }

    /// Give the lease up so the next campaigner does not have to wait out
    /// the full lease duration. Best-effort.
    async fn release(&self) {
        let record = match self.lock.get().await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                warn!(lease = %self.name, error = %err, "failed to read lease for release");
                return;
            }
        };
        if record.holder.as_deref() != Some(self.identity.as_str()) {
            return;
        }
        let released = LeaseRecord {
            holder: None,
            acquire_time: None,
            renew_time: None,
            lease_duration_millis: 0,
            transitions: record.transitions + 1,
            version: record.version,
        };
        if let Err(err) = self.lock.commit(released).await {
            warn!(lease = %self.name, error = %err, "failed to release lease");
        }
    }
}

#[async_trait]
impl LeaderElector for LeaseElector {
    async fn run<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        body: BoxFuture<'a, Result<(), Error>>,
    ) -> Result<(), Error> {
        info!(
            lease = %self.name,
            namespace = %self.namespace,
            identity = %self.identity,
            "running in leader election mode, waiting to acquire leadership"
        );
        if !self.campaign(ctx).await {
            return Ok(());
        }
        info!(lease = %self.name, identity = %self.identity, "leadership acquired, starting");

        let renewer = self.keep_renewed();
        tokio::pin!(renewer, body);
        tokio::select! {
            lost = &mut renewer => Err(lost),
            result = &mut body => {
                self.release().await;
                result
            }
        }
    }
}

fn instance_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_owned());
    // A per-process suffix keeps replicas on the same host distinguishable.
    let pid = std::process::id();
    let uniq = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!("{host}_{pid:x}{uniq:08x}")
}
