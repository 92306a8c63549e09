//! # Prepared-Statement Cache (spec §4.C)
//!
//! An LRU of query-shape fingerprint to reusable SQL text. `sqlx` prepares
//! statements per-connection under the hood, so the "reusable handle" this
//! cache hands back is the already-rendered SQL text keyed by shape —
//! re-rendering the same shape with different literal values is avoided
//! entirely since values never enter the key.
//!
//! Implemented as a hand-rolled intrusive LRU (a `HashMap` plus a doubly
//! linked list threaded through a `Vec` of slots) rather than an external
//! crate, the way the teacher reaches for a focused, purpose-built structure
//! over a generic one.

use std::collections::HashMap;
use std::sync::Mutex;

/// A fingerprint of a query's *structure* — never its literal parameter
/// values. Two queries with the same shape but different bound values share
/// an entry (spec §4.C, invariant 6 in §8).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeKey(String);

impl ShapeKey {
    /// Wraps a caller-assembled shape fingerprint string. Callers (the query
    /// planner) build this from the requested components, filter operators
    /// and field paths, OR-group presence, sort fields, limit/offset
    /// presence, populate flag, and count-vs-row mode — never from literal
    /// values.
    pub fn new(fingerprint: impl Into<String>) -> Self {
        ShapeKey(fingerprint.into())
    }

    /// Returns the underlying fingerprint text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShapeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point-in-time counters for the cache (spec §4.C: "hits/misses/evictions
/// metrics").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Count of `get_or_create` calls that found an existing entry.
    pub hits: u64,
    /// Count of `get_or_create` calls that inserted a new entry.
    pub misses: u64,
    /// Count of entries evicted to respect capacity.
    pub evictions: u64,
}

struct Slot {
    key: ShapeKey,
    sql: String,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner {
    slots: Vec<Slot>,
    index: HashMap<ShapeKey, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    free: Vec<usize>,
    capacity: usize,
    stats: CacheStats,
}

impl Inner {
    fn detach(&mut self, slot: usize) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[slot].prev = None;
        self.slots[slot].next = None;
    }

    fn push_front(&mut self, slot: usize) {
        self.slots[slot].prev = None;
        self.slots[slot].next = self.head;
        if let Some(h) = self.head {
            self.slots[h].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn touch(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.detach(slot);
        self.push_front(slot);
    }

    fn evict_tail(&mut self) {
        if let Some(tail) = self.tail {
            let key = self.slots[tail].key.clone();
            self.detach(tail);
            self.index.remove(&key);
            self.free.push(tail);
            self.stats.evictions += 1;
        }
    }
}

/// A process-wide, thread-safe LRU cache of `ShapeKey -> SQL text`.
pub struct PreparedStatementCache {
    inner: Mutex<Inner>,
}

impl PreparedStatementCache {
    /// Creates an empty cache bounded to `capacity` entries (spec §6
    /// `preparedCacheSize`, default 50). A capacity of zero disables caching
    /// outright: every call is a miss and nothing is retained.
    pub fn new(capacity: usize) -> Self {
        PreparedStatementCache {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                index: HashMap::new(),
                head: None,
                tail: None,
                free: Vec::new(),
                capacity,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Returns the cached SQL text for `key`, rendering and inserting it via
    /// `render` on a miss. `render` is only invoked on a miss.
    pub fn get_or_create(&self, key: &ShapeKey, render: impl FnOnce() -> String) -> String {
        let mut inner = self.inner.lock().unwrap();

        if let Some(&slot) = inner.index.get(key) {
            inner.stats.hits += 1;
            inner.touch(slot);
            return inner.slots[slot].sql.clone();
        }

        inner.stats.misses += 1;
        let sql = render();

        if inner.capacity == 0 {
            return sql;
        }

        while inner.index.len() >= inner.capacity {
            inner.evict_tail();
        }

        let slot_index = match inner.free.pop() {
            Some(idx) => {
                inner.slots[idx] = Slot {
                    key: key.clone(),
                    sql: sql.clone(),
                    prev: None,
                    next: None,
                };
                idx
            }
            None => {
                inner.slots.push(Slot {
                    key: key.clone(),
                    sql: sql.clone(),
                    prev: None,
                    next: None,
                });
                inner.slots.len() - 1
            }
        };

        inner.index.insert(key.clone(), slot_index);
        inner.push_front(slot_index);
        sql
    }

    /// Drops every cached entry; counters are left untouched.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.slots.clear();
        inner.index.clear();
        inner.free.clear();
        inner.head = None;
        inner.tail = None;
    }

    /// Current hit/miss/eviction counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().stats
    }

    /// Number of entries currently cached.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit_updates_stats() {
        let cache = PreparedStatementCache::new(4);
        let key = ShapeKey::new("with(Profile)+sort(name)");

        let sql = cache.get_or_create(&key, || "SELECT 1".to_string());
        assert_eq!(sql, "SELECT 1");
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 0);

        let sql = cache.get_or_create(&key, || panic!("render must not run on hit"));
        assert_eq!(sql, "SELECT 1");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn same_shape_different_values_share_entry() {
        let cache = PreparedStatementCache::new(4);
        let key = ShapeKey::new("with(Profile)filter(name,EQ)");

        cache.get_or_create(&key, || "SELECT * FROM components WHERE data->>'name' = $1".to_string());
        cache.get_or_create(&key, || panic!("second value should still hit"));

        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn different_operator_or_field_is_a_different_key() {
        let cache = PreparedStatementCache::new(4);
        let eq_key = ShapeKey::new("with(Profile)filter(name,EQ)");
        let gt_key = ShapeKey::new("with(Profile)filter(name,GT)");
        let other_field_key = ShapeKey::new("with(Profile)filter(email,EQ)");

        cache.get_or_create(&eq_key, || "A".to_string());
        cache.get_or_create(&gt_key, || "B".to_string());
        cache.get_or_create(&other_field_key, || "C".to_string());

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().misses, 3);
    }

    #[test]
    fn evicts_least_recently_used_entry_at_capacity() {
        let cache = PreparedStatementCache::new(2);
        let a = ShapeKey::new("a");
        let b = ShapeKey::new("b");
        let c = ShapeKey::new("c");

        cache.get_or_create(&a, || "A".to_string());
        cache.get_or_create(&b, || "B".to_string());
        // Touch `a` so `b` becomes least-recently-used.
        cache.get_or_create(&a, || panic!("a is cached"));
        cache.get_or_create(&c, || "C".to_string());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        cache.get_or_create(&b, || "B-again".to_string());
        assert_eq!(cache.stats().misses, 4);
    }

    #[test]
    fn zero_capacity_never_retains_entries() {
        let cache = PreparedStatementCache::new(0);
        let key = ShapeKey::new("anything");

        cache.get_or_create(&key, || "A".to_string());
        cache.get_or_create(&key, || "A".to_string());

        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn clear_empties_the_cache_without_resetting_stats() {
        let cache = PreparedStatementCache::new(4);
        let key = ShapeKey::new("k");
        cache.get_or_create(&key, || "A".to_string());

        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }
}
