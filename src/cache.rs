//! Generic bounded LRU cache with instrumentation counters.
//!
//! Used by the replay sources to keep hot query bodies close (one cache per
//! fingerprint hash) and exposed through the reporter's internal stats.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

const NIL: usize = usize::MAX;

/// Counter snapshot for a cache instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LruCacheStats {
    pub hits_total: u64,
    pub misses_total: u64,
    pub evictions_total: u64,
    pub move_to_front_total: u64,
    pub new_items_total: u64,
}

impl LruCacheStats {
    /// Accumulates another snapshot into this one.
    pub fn merge(&mut self, other: &LruCacheStats) {
        self.hits_total += other.hits_total;
        self.misses_total += other.misses_total;
        self.evictions_total += other.evictions_total;
        self.move_to_front_total += other.move_to_front_total;
        self.new_items_total += other.new_items_total;
    }
}

struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

struct Inner<K, V> {
    map: HashMap<K, usize>,
    nodes: Vec<Node<K, V>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    stats: LruCacheStats,
}

/// Bounded associative container with move-to-front on access.
///
/// All operations take a single internal mutex; `get_or_set` releases it
/// while the producer runs and re-checks before inserting.
pub struct LruCache<K, V> {
    cap: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    /// Creates a cache holding at most `cap` entries. `cap` must be >= 1.
    pub fn new(cap: usize) -> Self {
        assert!(cap >= 1, "lru cache capacity must be >= 1");
        Self {
            cap,
            inner: Mutex::new(Inner {
                map: HashMap::with_capacity(cap.min(1024)),
                nodes: Vec::with_capacity(cap.min(1024)),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
                stats: LruCacheStats::default(),
            }),
        }
    }

    /// Returns a snapshot of the stats counters.
    pub fn stats(&self) -> LruCacheStats {
        self.inner.lock().stats
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// True when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the value for `key`, bumping its recency.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        match inner.map.get(key).copied() {
            Some(idx) => {
                inner.stats.hits_total += 1;
                inner.move_to_front(idx);
                inner.stats.move_to_front_total += 1;
                Some(inner.nodes[idx].value.clone())
            }
            None => {
                inner.stats.misses_total += 1;
                None
            }
        }
    }

    /// Returns the value for `key` without touching recency or counters.
    pub fn peek(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        inner
            .map
            .get(key)
            .map(|&idx| inner.nodes[idx].value.clone())
    }

    /// Inserts `value` at the front, evicting the least-recent entry when
    /// the cache is full. Replaces in place (with a recency bump) when the
    /// key already exists.
    pub fn set(&self, key: K, value: V) -> V {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.map.get(&key).copied() {
            inner.nodes[idx].value = value.clone();
            inner.move_to_front(idx);
            inner.stats.move_to_front_total += 1;
            return value;
        }
        if inner.map.len() >= self.cap {
            inner.evict_tail();
        }
        inner.insert_front(key, value.clone());
        inner.stats.new_items_total += 1;
        value
    }

    /// Returns the cached value for `key` or invokes `producer` to build
    /// one. A producer failure behaves like a non-existent key: `None` is
    /// returned and the cache is left untouched.
    ///
    /// The producer runs outside the lock; a concurrent miss on the same
    /// key may race it, in which case whichever insert lands second wins
    /// the re-check and the earlier value is returned.
    pub fn get_or_set<E>(&self, key: K, producer: impl FnOnce() -> Result<V, E>) -> Option<V> {
        {
            let mut inner = self.inner.lock();
            if let Some(idx) = inner.map.get(&key).copied() {
                inner.stats.hits_total += 1;
                inner.move_to_front(idx);
                inner.stats.move_to_front_total += 1;
                return Some(inner.nodes[idx].value.clone());
            }
            inner.stats.misses_total += 1;
        }

        let value = producer().ok()?;

        let mut inner = self.inner.lock();
        if let Some(idx) = inner.map.get(&key).copied() {
            inner.stats.hits_total += 1;
            inner.move_to_front(idx);
            inner.stats.move_to_front_total += 1;
            return Some(inner.nodes[idx].value.clone());
        }

        inner.stats.misses_total += 1;
        if inner.map.len() >= self.cap {
            inner.evict_tail();
        }
        inner.insert_front(key, value.clone());
        inner.stats.new_items_total += 1;
        Some(value)
    }

    /// Key/value of the most recently used entry.
    pub fn most_recent(&self) -> Option<(K, V)> {
        let inner = self.inner.lock();
        if inner.head == NIL {
            return None;
        }
        let node = &inner.nodes[inner.head];
        Some((node.key.clone(), node.value.clone()))
    }

    /// Key/value of the least recently used entry.
    pub fn least_recent(&self) -> Option<(K, V)> {
        let inner = self.inner.lock();
        if inner.tail == NIL {
            return None;
        }
        let node = &inner.nodes[inner.tail];
        Some((node.key.clone(), node.value.clone()))
    }
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn attach_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.detach(idx);
        self.attach_front(idx);
    }

    fn insert_front(&mut self, key: K, value: V) {
        let idx = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Node {
                    key: key.clone(),
                    value,
                    prev: NIL,
                    next: NIL,
                };
                slot
            }
            None => {
                self.nodes.push(Node {
                    key: key.clone(),
                    value,
                    prev: NIL,
                    next: NIL,
                });
                self.nodes.len() - 1
            }
        };
        self.attach_front(idx);
        self.map.insert(key, idx);
    }

    fn evict_tail(&mut self) {
        let idx = self.tail;
        if idx == NIL {
            return;
        }
        self.detach(idx);
        let key = self.nodes[idx].key.clone();
        self.map.remove(&key);
        self.free.push(idx);
        self.stats.evictions_total += 1;
    }
}
