//! In-memory key→object cache shared between the informer and the workers.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::resource::{ObjectKey, ResourceObject};

type CacheMap<K> = Arc<RwLock<AHashMap<ObjectKey, Arc<K>>>>;

/// The writable half of the cache, owned by the informer.
///
/// Exclusive: sharing a writer between informers would let relist swaps
/// clobber each other.
#[derive(Debug)]
pub struct StoreWriter<K: ResourceObject> {
    store: CacheMap<K>,
}

/// What changed when a relist snapshot was swapped into the store.
pub struct ReplaceOutcome<K> {
    /// Objects that were not present before the swap.
    pub added: Vec<Arc<K>>,
    /// Objects present before and after, paired `(old, new)`.
    pub updated: Vec<(Arc<K>, Arc<K>)>,
    /// Keys that vanished across the relist, with their last known state.
    pub deleted: Vec<(ObjectKey, Arc<K>)>,
}

impl<K: ResourceObject> Default for StoreWriter<K> {
    fn default() -> Self {
        Self {
            store: Default::default(),
        }
    }
}

impl<K: ResourceObject> StoreWriter<K> {
    /// Return a read handle. Any number of readers may coexist.
    #[must_use]
    pub fn as_reader(&self) -> Store<K> {
        Store {
            store: Arc::clone(&self.store),
        }
    }

    /// Insert or overwrite a single object, returning the previous state.
    pub fn apply(&mut self, obj: &K) -> Option<Arc<K>> {
        let key = obj.object_key();
        self.store.write().insert(key, Arc::new(obj.clone()))
    }

    /// Remove a single object, returning the previous state.
    pub fn remove(&mut self, key: &ObjectKey) -> Option<Arc<K>> {
        self.store.write().remove(key)
    }

    /// Atomically replace the cache contents with a full snapshot.
    ///
    /// Readers observe either the old state or the new one, never a mix.
    pub fn replace(&mut self, items: &[K]) -> ReplaceOutcome<K> {
        let mut next = AHashMap::with_capacity(items.len());
        for obj in items {
            next.insert(obj.object_key(), Arc::new(obj.clone()));
        }

        let mut outcome = ReplaceOutcome {
            added: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        };
        {
            let mut store = self.store.write();
            for (key, new) in &next {
                match store.get(key) {
                    Some(old) => outcome.updated.push((Arc::clone(old), Arc::clone(new))),
                    None => outcome.added.push(Arc::clone(new)),
                }
            }
            for (key, old) in store.iter() {
                if !next.contains_key(key) {
                    outcome.deleted.push((key.clone(), Arc::clone(old)));
                }
            }
            *store = next;
        }
        outcome
    }
}

/// A readable cache of the latest-observed objects.
///
/// Cloning produces a new handle onto the same backing store. Reads are
/// internally synchronized and atomic with respect to writer updates.
#[derive(Debug)]
pub struct Store<K: ResourceObject> {
    store: CacheMap<K>,
}

impl<K: ResourceObject> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<K: ResourceObject> Store<K> {
    /// Retrieve the entry referred to by `key`, if cached.
    #[must_use]
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.store.read().get(key).cloned()
    }

    /// A snapshot of every cached object.
    #[must_use]
    pub fn state(&self) -> Vec<Arc<K>> {
        self.store.read().values().cloned().collect()
    }

    /// Number of cached objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestObject;

    fn obj(name: &str, version: &str) -> TestObject {
        TestObject::cluster_scoped("Thing", name).with_resource_version(version)
    }

    #[test]
    fn apply_and_get() {
        let mut writer = StoreWriter::default();
        let store = writer.as_reader();

        assert!(writer.apply(&obj("a", "1")).is_none());
        let prev = writer.apply(&obj("a", "2"));
        assert_eq!(prev.unwrap().resource_version(), Some("1"));

        let cached = store.get(&ObjectKey::cluster_scoped("a")).unwrap();
        assert_eq!(cached.resource_version(), Some("2"));
        assert!(store.get(&ObjectKey::cluster_scoped("b")).is_none());
    }

    #[test]
    fn namespaced_and_cluster_keys_are_distinct() {
        let mut writer = StoreWriter::default();
        let store = writer.as_reader();
        writer.apply(&TestObject::namespaced("Thing", "ns", "a"));

        assert!(store.get(&ObjectKey::namespaced("ns", "a")).is_some());
        assert!(store.get(&ObjectKey::cluster_scoped("a")).is_none());
    }

    #[test]
    fn replace_reports_the_difference() {
        let mut writer = StoreWriter::default();
        let store = writer.as_reader();
        writer.apply(&obj("keep", "1"));
        writer.apply(&obj("drop", "1"));

        let outcome = writer.replace(&[obj("keep", "2"), obj("new", "1")]);

        assert_eq!(outcome.added.len(), 1);
        assert_eq!(outcome.added[0].name(), "new");
        assert_eq!(outcome.updated.len(), 1);
        assert_eq!(outcome.updated[0].0.resource_version(), Some("1"));
        assert_eq!(outcome.updated[0].1.resource_version(), Some("2"));
        assert_eq!(outcome.deleted.len(), 1);
        assert_eq!(outcome.deleted[0].0, ObjectKey::cluster_scoped("drop"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn remove_clears_the_entry() {
        let mut writer = StoreWriter::default();
        let store = writer.as_reader();
        writer.apply(&obj("a", "1"));
        assert!(writer.remove(&ObjectKey::cluster_scoped("a")).is_some());
        assert!(store.is_empty());
    }
}
