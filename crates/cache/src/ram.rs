//! In-memory cache tiers with LRU eviction
//!
//! Holds decoded and scaled images in memory. Each tier is bounded by an
//! entry count; when an insert pushes the tier over capacity the least
//! recently used entries are dropped. Eviction is silent: everything a tier
//! holds can be rebuilt from the disk cache or the source file.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One level of a multi-level cache
pub trait CacheTier<K, V> {
    /// Look up `key`, marking it most recently used on a hit
    fn get(&self, key: &K) -> Option<V>;

    /// Insert or replace `key`, evicting least recently used entries while
    /// the tier is over capacity
    fn put(&self, key: K, value: V);

    /// Drop every entry
    fn clear(&self);

    /// Number of entries currently held
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries kept
    fn capacity(&self) -> usize;
}

/// Statistics about tier usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    /// Number of entries currently in the tier
    pub entries: usize,

    /// Maximum number of entries
    pub capacity: usize,

    /// Number of cache hits
    pub hits: u64,

    /// Number of cache misses
    pub misses: u64,

    /// Number of entries evicted due to capacity pressure
    pub evictions: u64,
}

impl TierStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

const NIL: usize = usize::MAX;

/// A slot of the recency list
struct CacheEntry<K, V> {
    key: K,
    value: V,
    /// Neighbour towards the most recently used end
    prev: usize,
    /// Neighbour towards the least recently used end
    next: usize,
}

/// Hash map into a slab of entries threaded on a doubly linked list.
/// `head` is the most recently used entry, `tail` the least.
struct LruState<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<CacheEntry<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: Hash + Eq + Clone, V> LruState<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn links(&self, idx: usize) -> Option<(usize, usize)> {
        self.slots[idx].as_ref().map(|entry| (entry.prev, entry.next))
    }

    fn set_prev(&mut self, idx: usize, prev: usize) {
        if let Some(entry) = self.slots[idx].as_mut() {
            entry.prev = prev;
        }
    }

    fn set_next(&mut self, idx: usize, next: usize) {
        if let Some(entry) = self.slots[idx].as_mut() {
            entry.next = next;
        }
    }

    /// Unlink a slot from the recency list
    fn detach(&mut self, idx: usize) {
        let Some((prev, next)) = self.links(idx) else {
            return;
        };

        if prev == NIL {
            self.head = next;
        } else {
            self.set_next(prev, next);
        }

        if next == NIL {
            self.tail = prev;
        } else {
            self.set_prev(next, prev);
        }

        self.set_prev(idx, NIL);
        self.set_next(idx, NIL);
    }

    /// Link a detached slot in as most recently used
    fn attach_front(&mut self, idx: usize) {
        let old_head = self.head;
        self.set_prev(idx, NIL);
        self.set_next(idx, old_head);

        if old_head != NIL {
            self.set_prev(old_head, idx);
        }
        self.head = idx;

        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head != idx {
            self.detach(idx);
            self.attach_front(idx);
        }
    }

    fn get(&mut self, key: &K) -> Option<&V> {
        match self.index.get(key).copied() {
            Some(idx) => {
                self.touch(idx);
                self.hits += 1;
                self.slots[idx].as_ref().map(|entry| &entry.value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn insert(&mut self, key: K, value: V) {
        if let Some(idx) = self.index.get(&key).copied() {
            if let Some(entry) = self.slots[idx].as_mut() {
                entry.value = value;
            }
            self.touch(idx);
        } else {
            let entry = CacheEntry {
                key: key.clone(),
                value,
                prev: NIL,
                next: NIL,
            };
            let idx = match self.free.pop() {
                Some(idx) => {
                    self.slots[idx] = Some(entry);
                    idx
                }
                None => {
                    self.slots.push(Some(entry));
                    self.slots.len() - 1
                }
            };
            self.index.insert(key, idx);
            self.attach_front(idx);
        }

        self.evict_to_capacity();
    }

    fn evict_to_capacity(&mut self) {
        while self.index.len() > self.capacity {
            if self.pop_lru().is_none() {
                break;
            }
            self.evictions += 1;
        }
    }

    fn take_slot(&mut self, idx: usize) -> Option<CacheEntry<K, V>> {
        self.detach(idx);
        let entry = self.slots[idx].take()?;
        self.index.remove(&entry.key);
        self.free.push(idx);
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<(K, V)> {
        if self.tail == NIL {
            return None;
        }
        let entry = self.take_slot(self.tail)?;
        tracing::trace!(remaining = self.index.len(), "evicted least recently used entry");
        Some((entry.key, entry.value))
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.index.get(key).copied()?;
        self.take_slot(idx).map(|entry| entry.value)
    }

    fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    fn stats(&self) -> TierStats {
        TierStats {
            entries: self.index.len(),
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

/// Bounded in-memory LRU tier
///
/// Thread-safe: clones share the same entries, and every operation holds the
/// internal lock only for the map update itself. Values are handed out as
/// clones, so store `Arc`s for large payloads.
///
/// # Example
///
/// ```
/// use card_export_cache::{CacheTier, MemoryCacheTier};
///
/// let tier = MemoryCacheTier::new(2);
/// tier.put("a", 1);
/// tier.put("b", 2);
/// assert_eq!(tier.get(&"a"), Some(1));
///
/// // "b" is now least recently used and makes room for "c".
/// tier.put("c", 3);
/// assert_eq!(tier.get(&"b"), None);
/// ```
pub struct MemoryCacheTier<K, V> {
    state: Arc<Mutex<LruState<K, V>>>,
}

impl<K, V> Clone for MemoryCacheTier<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> MemoryCacheTier<K, V> {
    /// Create a tier holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(LruState::new(capacity))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check for a key without updating recency
    pub fn contains(&self, key: &K) -> bool {
        self.lock().index.contains_key(key)
    }

    /// Remove an entry, returning its value
    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().remove(key)
    }

    /// Change the capacity, evicting immediately if the tier is now over it
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.lock();
        state.capacity = capacity;
        state.evict_to_capacity();
    }

    /// Get current tier statistics
    pub fn stats(&self) -> TierStats {
        self.lock().stats()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> CacheTier<K, V> for MemoryCacheTier<K, V> {
    fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    fn put(&self, key: K, value: V) {
        self.lock().insert(key, value);
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn len(&self) -> usize {
        self.lock().index.len()
    }

    fn capacity(&self) -> usize {
        self.lock().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheKey, PixelBuffer, PixelFormat};

    fn buffer(seed: u8) -> Arc<PixelBuffer> {
        let bytes = (0..16u8).map(|i| i.wrapping_mul(seed)).collect();
        Arc::new(PixelBuffer::new(2, 2, PixelFormat::Rgba8, bytes).unwrap())
    }

    #[test]
    fn test_basic_put_get() {
        let tier = MemoryCacheTier::new(4);
        let key = CacheKey::new("/a.png", (10, 10));
        let value = buffer(3);

        tier.put(key.clone(), Arc::clone(&value));

        let hit = tier.get(&key).expect("entry should be cached");
        assert_eq!(hit.bytes(), value.bytes());
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_cache_miss() {
        let tier: MemoryCacheTier<u32, u32> = MemoryCacheTier::new(4);
        assert!(tier.get(&999).is_none());

        let stats = tier.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_overflow_evicts_exactly_the_lru_entry() {
        let capacity = 5;
        let tier = MemoryCacheTier::new(capacity);

        for i in 0..=capacity as u32 {
            tier.put(i, i * 10);
        }

        assert_eq!(tier.len(), capacity);
        assert!(!tier.contains(&0));
        for i in 1..=capacity as u32 {
            assert_eq!(tier.get(&i), Some(i * 10));
        }
        assert_eq!(tier.stats().evictions, 1);
    }

    #[test]
    fn test_get_protects_from_next_eviction() {
        let tier = MemoryCacheTier::new(2);
        tier.put(1, "one");
        tier.put(2, "two");

        // Access 1 so that 2 becomes least recently used
        assert!(tier.get(&1).is_some());
        tier.put(3, "three");

        assert!(tier.contains(&1));
        assert!(!tier.contains(&2));
        assert!(tier.contains(&3));
    }

    #[test]
    fn test_contains_does_not_touch() {
        let tier = MemoryCacheTier::new(2);
        tier.put(1, ());
        tier.put(2, ());

        assert!(tier.contains(&1));
        tier.put(3, ());

        assert!(!tier.contains(&1));
    }

    #[test]
    fn test_replace_existing_key() {
        let tier = MemoryCacheTier::new(2);
        tier.put(1, 10);
        tier.put(2, 20);
        tier.put(1, 11);

        assert_eq!(tier.len(), 2);
        assert_eq!(tier.get(&1), Some(11));

        // Replacing refreshed 1, so 2 goes first
        tier.put(3, 30);
        assert!(!tier.contains(&2));
        assert_eq!(tier.stats().evictions, 1);
    }

    #[test]
    fn test_remove_and_slot_reuse() {
        let tier = MemoryCacheTier::new(3);
        tier.put(1, 1);
        tier.put(2, 2);
        tier.put(3, 3);

        assert_eq!(tier.remove(&2), Some(2));
        assert_eq!(tier.remove(&2), None);
        assert_eq!(tier.len(), 2);

        tier.put(4, 4);
        tier.put(5, 5);

        // 1 was the oldest survivor
        assert!(!tier.contains(&1));
        assert!(tier.contains(&3));
        assert!(tier.contains(&4));
        assert!(tier.contains(&5));
    }

    #[test]
    fn test_clear() {
        let tier = MemoryCacheTier::new(8);
        for i in 0..5 {
            tier.put(i, i);
        }

        tier.clear();

        assert!(tier.is_empty());
        assert!(!tier.contains(&0));

        tier.put(9, 9);
        assert_eq!(tier.get(&9), Some(9));
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let tier = MemoryCacheTier::new(0);
        tier.put(1, 1);
        assert!(tier.is_empty());
        assert!(tier.get(&1).is_none());
    }

    #[test]
    fn test_set_capacity_evicts_oldest() {
        let tier = MemoryCacheTier::new(10);
        for i in 0..10 {
            tier.put(i, i);
        }

        tier.set_capacity(4);

        assert_eq!(tier.len(), 4);
        for i in 6..10 {
            assert!(tier.contains(&i), "entry {} should survive", i);
        }
        assert_eq!(tier.capacity(), 4);
    }

    #[test]
    fn test_stats_hit_rate() {
        let tier = MemoryCacheTier::new(4);
        tier.put(1, 1);

        let _ = tier.get(&1);
        let _ = tier.get(&2);
        let _ = tier.get(&3);

        let stats = tier.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_rate() - 0.333).abs() < 0.01);
    }

    #[test]
    fn test_long_access_sequence_matches_reference_model() {
        // Compare against a naive Vec-ordered LRU over a deterministic workload
        let tier = MemoryCacheTier::new(7);
        let mut model: Vec<u32> = Vec::new();

        for step in 0..2_000u32 {
            let key = (step * 31 + step / 7) % 23;
            if step % 3 == 0 {
                let hit = tier.get(&key).is_some();
                let model_hit = model.contains(&key);
                assert_eq!(hit, model_hit, "step {}", step);
                if model_hit {
                    model.retain(|&k| k != key);
                    model.push(key);
                }
            } else {
                tier.put(key, step);
                model.retain(|&k| k != key);
                model.push(key);
                if model.len() > 7 {
                    model.remove(0);
                }
            }
        }

        assert_eq!(tier.len(), model.len());
        for key in &model {
            assert!(tier.contains(key));
        }
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let tier: MemoryCacheTier<u64, u64> = MemoryCacheTier::new(64);
        let mut handles = vec![];

        for thread_id in 0..4u64 {
            let tier = tier.clone();
            handles.push(thread::spawn(move || {
                let start = thread_id * 1000;
                for i in start..start + 500 {
                    tier.put(i, i);
                    let _ = tier.get(&i);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(tier.len() <= 64);
    }
}
