//! Keyed registry whose entries live only as long as someone is using them.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use foldhash::HashMap;
use parking_lot::Mutex;

/// A map from keys to the latest shared instance for that key, with reference-counted entries.
///
/// Every use of an entry holds a [`Lease`]. The entry is removed as soon as the last lease on it
/// is dropped, so a long-lived registry does not accumulate entries for keys nobody uses anymore.
///
/// Cloning a registry creates another handle to the same entries.
pub struct Registry<K, V> {
    entries: Arc<Mutex<HashMap<K, Entry<V>>>>,
}

struct Entry<V> {
    /// `None` once the latest instance has been retired and before a new one is created.
    latest: Option<Arc<V>>,

    leases: usize,
}

impl<K, V> Registry<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::default())),
        }
    }

    /// Takes a lease on the entry for `key` and returns its latest instance.
    ///
    /// If there is no latest instance yet, or `replace` says the current one must not be reused,
    /// a new instance is made with `create` and becomes the latest.
    pub fn acquire(
        &self,
        key: &K,
        create: impl FnOnce() -> V,
        replace: impl FnOnce(&V) -> bool,
    ) -> (Arc<V>, Lease<K, V>) {
        let mut entries = self.entries.lock();

        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            latest: None,
            leases: 0,
        });

        entry.leases = entry
            .leases
            .checked_add(1)
            .expect("lease count cannot realistically exceed usize::MAX");

        let reusable = entry.latest.as_ref().is_some_and(|latest| !replace(latest));

        let instance = match &entry.latest {
            Some(latest) if reusable => Arc::clone(latest),
            _ => {
                let fresh = Arc::new(create());
                entry.latest = Some(Arc::clone(&fresh));
                fresh
            }
        };

        let lease = Lease {
            entries: Arc::clone(&self.entries),
            key: key.clone(),
        };

        (instance, lease)
    }

    /// The latest instance for `key`, if the key has an entry and the instance is not retired.
    #[must_use]
    pub fn latest(&self, key: &K) -> Option<Arc<V>> {
        self.entries
            .lock()
            .get(key)
            .and_then(|entry| entry.latest.clone())
    }

    /// The number of keys that currently have an entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no key currently has an entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for Registry<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<K, V> fmt::Debug for Registry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

/// Keeps an entry of a [`Registry`] alive. Dropping the last lease on an entry removes it.
#[must_use = "the registry entry is released as soon as the lease is dropped"]
pub struct Lease<K, V>
where
    K: Eq + Hash,
{
    entries: Arc<Mutex<HashMap<K, Entry<V>>>>,
    key: K,
}

impl<K, V> Lease<K, V>
where
    K: Eq + Hash,
{
    /// The key this lease is held on.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Stops handing out `instance` as the latest instance for the key, if it still is.
    ///
    /// The next [`Registry::acquire()`] for the key creates a new instance.
    pub fn retire(&self, instance: &Arc<V>) {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&self.key) {
            if entry
                .latest
                .as_ref()
                .is_some_and(|latest| Arc::ptr_eq(latest, instance))
            {
                entry.latest = None;
            }
        }
    }
}

impl<K, V> Drop for Lease<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let mut entries = self.entries.lock();

        let Some(entry) = entries.get_mut(&self.key) else {
            return;
        };

        entry.leases = entry.leases.saturating_sub(1);

        if entry.leases == 0 {
            entries.remove(&self.key);
        }
    }
}

impl<K, V> fmt::Debug for Lease<K, V>
where
    K: Eq + Hash + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
