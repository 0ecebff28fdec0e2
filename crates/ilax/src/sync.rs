//! Mutex-guarded containers shared between generation units.
//!
//! Every method takes the lock exactly once, so each call is atomic with
//! respect to concurrent units. Compound operations that must not be split
//! (contains-then-insert, snapshot-then-clear, emplace-then-modify) are
//! exposed as single methods rather than left to callers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::ExtractError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking worker is reported through its join handle; the data
    // itself is still consistent because every mutation is a single call.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An ordered set of names.
#[derive(Debug, Default)]
pub struct SyncSet {
    inner: Mutex<BTreeSet<String>>,
}

impl SyncSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the name was not present before.
    pub fn insert(&self, name: impl Into<String>) -> bool {
        lock(&self.inner).insert(name.into())
    }

    pub fn remove(&self, name: &str) -> bool {
        lock(&self.inner).remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.inner).contains(name)
    }

    /// Removes and returns the smallest name.
    pub fn pop_first(&self) -> Option<String> {
        lock(&self.inner).pop_first()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn clear(&self) {
        lock(&self.inner).clear();
    }

    /// Point-in-time copy of the contents.
    pub fn snapshot(&self) -> BTreeSet<String> {
        lock(&self.inner).clone()
    }

    /// Point-in-time copy of the contents, leaving the set empty.
    pub fn take(&self) -> BTreeSet<String> {
        std::mem::take(&mut *lock(&self.inner))
    }

    pub fn extend<I>(&self, names: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut guard = lock(&self.inner);
        guard.extend(names.into_iter().map(Into::into));
    }
}

/// Counter of units currently in flight.
#[derive(Debug, Default)]
pub struct ThreadCount {
    inner: Mutex<u32>,
}

impl ThreadCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increase(&self) -> u32 {
        let mut count = lock(&self.inner);
        *count += 1;
        *count
    }

    pub fn decrease(&self) -> Result<u32, ExtractError> {
        let mut count = lock(&self.inner);
        if *count == 0 {
            return Err(ExtractError::ThreadCountUnderflow);
        }
        *count -= 1;
        Ok(*count)
    }

    pub fn get(&self) -> u32 {
        *lock(&self.inner)
    }
}

/// Append-only list.
#[derive(Debug)]
pub struct SyncList<T> {
    inner: Mutex<Vec<T>>,
}

impl<T> Default for SyncList<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> SyncList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        lock(&self.inner).push(item);
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    pub fn snapshot(&self) -> Vec<T> {
        lock(&self.inner).clone()
    }
}

/// Name-keyed map.
#[derive(Debug)]
pub struct SyncMap<V> {
    inner: Mutex<BTreeMap<String, V>>,
}

impl<V> Default for SyncMap<V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<V> SyncMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` unless the key is already present. Returns `true` on insertion.
    pub fn emplace(&self, key: impl Into<String>, value: V) -> bool {
        let mut guard = lock(&self.inner);
        let key = key.into();
        if guard.contains_key(&key) {
            return false;
        }
        guard.insert(key, value);
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.inner).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    /// Runs `f` on the entry for `key`, if any, under the lock.
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        lock(&self.inner).get_mut(key).map(f)
    }

    /// Emplaces `make()` if the key is absent, then runs `f` on the entry.
    /// The flag passed to `f` tells whether the entry was just created.
    pub fn upsert<R>(
        &self,
        key: &str,
        make: impl FnOnce() -> V,
        f: impl FnOnce(&mut V, bool) -> R,
    ) -> R {
        let mut guard = lock(&self.inner);
        let created = !guard.contains_key(key);
        let entry = guard.entry(key.to_string()).or_insert_with(make);
        f(entry, created)
    }

    /// Runs `f` over the whole map under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&BTreeMap<String, V>) -> R) -> R {
        f(&lock(&self.inner))
    }
}

impl<V: Clone> SyncMap<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        lock(&self.inner).get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, V> {
        lock(&self.inner).clone()
    }
}
