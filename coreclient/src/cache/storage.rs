// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{collections::HashMap, num::NonZeroUsize, time::Duration};

use fieldapiclient::ApiResponse;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Bounds of a single namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceLimits {
    /// Least recently used entries are evicted beyond this count
    pub max_entries: Option<NonZeroUsize>,
    /// Older entries are treated as absent
    pub max_age: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    pub response: ApiResponse,
    pub cached_at: Instant,
}

impl CachedEntry {
    pub fn new(response: ApiResponse) -> Self {
        Self {
            response,
            cached_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, max_age: Option<Duration>) -> bool {
        max_age.is_some_and(|max_age| self.cached_at.elapsed() > max_age)
    }
}

/// Request-keyed, namespace-partitioned response store.
#[cfg_attr(test, mockall::automock)]
pub trait CacheStorage: Send + Sync + 'static {
    /// Creates the namespace if it does not exist yet.
    fn open(&self, namespace: &str, limits: NamespaceLimits);

    fn lookup(&self, namespace: &str, key: &str) -> Option<CachedEntry>;

    /// Returns `false` if the namespace does not exist (anymore); nothing is stored then.
    fn put(&self, namespace: &str, key: &str, entry: CachedEntry) -> bool;

    fn delete(&self, namespace: &str, key: &str) -> bool;

    fn namespaces(&self) -> Vec<String>;

    fn delete_namespace(&self, namespace: &str) -> bool;
}

/// In-memory [`CacheStorage`] with one LRU cache per namespace.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    namespaces: Mutex<HashMap<String, LruCache<String, CachedEntry>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Default::default()
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn open(&self, namespace: &str, limits: NamespaceLimits) {
        self.namespaces
            .lock()
            .entry(namespace.to_owned())
            .or_insert_with(|| {
                debug!(namespace, ?limits, "creating cache namespace");
                match limits.max_entries {
                    Some(capacity) => LruCache::new(capacity),
                    None => LruCache::unbounded(),
                }
            });
    }

    fn lookup(&self, namespace: &str, key: &str) -> Option<CachedEntry> {
        self.namespaces.lock().get_mut(namespace)?.get(key).cloned()
    }

    fn put(&self, namespace: &str, key: &str, entry: CachedEntry) -> bool {
        match self.namespaces.lock().get_mut(namespace) {
            Some(entries) => {
                entries.put(key.to_owned(), entry);
                true
            }
            None => false,
        }
    }

    fn delete(&self, namespace: &str, key: &str) -> bool {
        self.namespaces
            .lock()
            .get_mut(namespace)
            .and_then(|entries| entries.pop(key))
            .is_some()
    }

    fn namespaces(&self) -> Vec<String> {
        self.namespaces.lock().keys().cloned().collect()
    }

    fn delete_namespace(&self, namespace: &str) -> bool {
        self.namespaces.lock().remove(namespace).is_some()
    }
}
