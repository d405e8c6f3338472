//! # Result Cache Manager
//!
//! Bounded LRU cache of query results, keyed by query text. The cache is
//! opt-in: it is constructed lazily at bring-up and kept across mode
//! transitions, but the engine only hands it out when the configuration
//! enables it.
//!
//! Entries remember the tables they were computed from so DDL can
//! invalidate exactly the affected results.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

/// A cached query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResult {
    pub payload: Arc<Vec<u8>>,
    pub tables: SmallVec<[String; 2]>,
}

struct Entry {
    result: CachedResult,
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    tick: u64,
}

pub struct ResultCacheManager {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl ResultCacheManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, query: &str) -> Option<CachedResult> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.entries.get_mut(query)?;
        entry.last_used = tick;
        Some(entry.result.clone())
    }

    /// Inserts a result, evicting the least recently used entry when full.
    pub fn put(&self, query: &str, tables: &[&str], payload: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.entries.contains_key(query) && inner.entries.len() >= self.capacity {
            if let Some(victim) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(q, _)| q.clone())
            {
                inner.entries.remove(&victim);
            }
        }

        inner.entries.insert(
            query.to_string(),
            Entry {
                result: CachedResult {
                    payload: Arc::new(payload),
                    tables: tables.iter().map(|t| t.to_string()).collect(),
                },
                last_used: tick,
            },
        );
    }

    /// Drops every result computed from `table`.
    pub fn invalidate_table(&self, table: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| !e.result.tables.iter().any(|t| t == table));
        before - inner.entries.len()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}
