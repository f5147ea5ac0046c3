//! The object contract the runtime operates on.
//!
//! The core never inspects resource payloads: everything it needs is the
//! identity exposed by [`ResourceObject`], and the only currency that moves
//! through the work queue is the [`ObjectKey`] derived from it.

use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;

/// An opaque resource observed from the remote API.
///
/// Implemented by whatever concrete type (or tagged union of types, for
/// multi-retriever setups) a controller reconciles. Handlers downcast or
/// match at their own boundary; the runtime only reads the identity.
pub trait ResourceObject: Clone + Send + Sync + 'static {
    /// The resource class, e.g. `"Namespace"`.
    fn kind(&self) -> &str;

    /// The object name, unique within its namespace (or cluster-wide for
    /// cluster-scoped resources).
    fn name(&self) -> &str;

    /// The namespace, or `None` for cluster-scoped resources.
    fn namespace(&self) -> Option<&str>;

    /// The opaque version assigned by the remote API, if known.
    fn resource_version(&self) -> Option<&str>;

    /// The cache/queue key for this object.
    fn object_key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.namespace().map(str::to_owned),
            name: self.name().to_owned(),
        }
    }
}

/// Uniquely identifies a resource within a retriever's scope.
///
/// Renders as `"<namespace>/<name>"`, or just `"<name>"` for cluster-scoped
/// resources. Keys from different retrievers composed through a
/// multi-retriever must be globally unique; the runtime treats them
/// uniformly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Namespace component, absent for cluster-scoped resources.
    pub namespace: Option<String>,
    /// Name component.
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced resource.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped resource.
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Error parsing an [`ObjectKey`] from its string form.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid object key {key:?}: expected \"name\" or \"namespace/name\"")]
pub struct ParseKeyError {
    key: String,
}

impl FromStr for ObjectKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(ObjectKey::cluster_scoped(name)),
            (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => {
                Ok(ObjectKey::namespaced(ns, name))
            }
            _ => Err(ParseKeyError { key: s.to_owned() }),
        }
    }
}
