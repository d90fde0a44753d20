use std::borrow::Borrow;
use std::hash::Hash;

use dashmap::{mapref::entry::Entry, DashMap};

/// Concurrent map owned by a manager. Values are expected to be cheap to
/// clone (usually an `Arc`), so every read hands out an owned copy and no
/// shard guard escapes this type.
pub struct Registry<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, V>,
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    /// Inserts unconditionally, returning the displaced value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    /// Returns the stored value and whether `create` produced it. `create`
    /// only runs when the key is vacant and runs under the shard lock.
    pub fn get_or_insert_with<F>(&self, key: K, create: F) -> (V, bool)
    where
        F: FnOnce() -> V,
    {
        match self.entries.entry(key) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let value = create();
                entry.insert(value.clone());
                (value, true)
            }
        }
    }

    /// Replaces the value for `key` with the result of `update`, which sees
    /// the current value (if any) while the shard lock is held.
    pub fn upsert<F>(&self, key: K, update: F) -> V
    where
        F: FnOnce(Option<&V>) -> V,
    {
        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                let value = update(Some(entry.get()));
                entry.insert(value.clone());
                value
            }
            Entry::Vacant(entry) => {
                let value = update(None);
                entry.insert(value.clone());
                value
            }
        }
    }

    /// Atomically removes and returns the value.
    pub fn pop<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key).map(|(_, value)| value)
    }

    /// Removes the entry only if `predicate` still holds under the shard lock.
    pub fn remove_if<Q, F>(&self, key: &Q, predicate: F) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> bool,
    {
        self.entries
            .remove_if(key, |_, value| predicate(value))
            .map(|(_, value)| value)
    }

    /// Point-in-time copy of all entries. Writers running concurrently may or
    /// may not be reflected.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
