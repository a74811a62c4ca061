use std::sync::Arc;

use lru::LruCache as LruMap;
use parking_lot::RwLock;

/// Immutable once inserted. The body is shared, not copied, so a cache
/// replacement never invalidates bodies already handed to in-flight
/// responses.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub body: Arc<[u8]>,
    pub size: usize,
    pub last_modified: i64,
    pub etag: String,
}

impl CacheEntry {
    pub fn new(body: Arc<[u8]>, last_modified: i64, etag: String) -> Self {
        let size = body.len();
        Self {
            body,
            size,
            last_modified,
            etag,
        }
    }
}

struct Inner {
    // Recency order lives in the map itself: get promotes, pop_lru evicts.
    map: LruMap<String, CacheEntry>,
    used_bytes: usize,
}

/// Byte-bounded LRU mapping from canonical URL path to cached file body,
/// shared across all connections and both transports.
///
/// `get` promotes recency and therefore takes the exclusive lock; the
/// promotion is atomic with the returned snapshot.
pub struct LruCache {
    capacity_bytes: usize,
    inner: RwLock<Inner>,
}

impl LruCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            inner: RwLock::new(Inner {
                map: LruMap::unbounded(),
                used_bytes: 0,
            }),
        }
    }

    /// Returns a snapshot of the entry and marks the key most-recently-used.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.write();
        inner.map.get(key).cloned()
    }

    /// Inserts or replaces at most-recent, then evicts from the LRU end
    /// until `used_bytes <= capacity_bytes`. A single entry larger than the
    /// whole capacity is allowed to reside alone.
    pub fn put(&self, key: String, entry: CacheEntry) {
        let mut inner = self.inner.write();
        let added = entry.size;
        if let Some(old) = inner.map.put(key, entry) {
            inner.used_bytes -= old.size;
        }
        inner.used_bytes += added;

        while inner.used_bytes > self.capacity_bytes && inner.map.len() > 1 {
            if let Some((_, evicted)) = inner.map.pop_lru() {
                inner.used_bytes -= evicted.size;
            } else {
                break;
            }
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.read().used_bytes
    }

    pub fn items(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }
}
