//! Bounded LRU cache with per-entry time-to-live.
//!
//! Recency is tracked with a monotonically increasing access tick; the
//! `order` index maps tick → key so the least recently used entry is
//! always `order`'s first element.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    tick: u64,
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    order: BTreeMap<u64, K>,
    next_tick: u64,
    capacity: usize,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Returns a fresh copy of the value and marks it most recently used.
    /// Expired entries are dropped on the spot and never returned.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let expired = self.entries.get(key)?.inserted_at.elapsed() >= self.ttl;
        if expired {
            self.remove(key);
            return None;
        }

        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.clone());
        Some(entry.value.clone())
    }

    /// Inserts or refreshes `key`, evicting expired entries first and then
    /// the least recently used ones until the new entry fits.
    pub fn insert(&mut self, key: K, value: V) {
        self.remove(&key);
        self.purge_expired();
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }

        let tick = self.bump();
        self.order.insert(tick, key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                tick,
            },
        );
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry.value)
    }

    /// Drops every entry unconditionally.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Includes entries that have expired but were not touched since.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn purge_expired(&mut self) {
        let ttl = self.ttl;
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> TtlCache<String, u32> {
        TtlCache::new(capacity, Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_capacity() {
        let mut c = cache(3);
        for i in 0..10 {
            c.insert(format!("k{i}"), i);
            assert!(c.len() <= 3);
        }
        assert_eq!(c.len(), 3);
        assert_eq!(c.get(&"k9".to_string()), Some(9));
        assert_eq!(c.get(&"k0".to_string()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_least_recently_used() {
        let mut c = cache(2);
        c.insert("a".into(), 1);
        c.insert("b".into(), 2);
        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(c.get(&"a".to_string()), Some(1));
        c.insert("c".into(), 3);

        assert_eq!(c.get(&"a".to_string()), Some(1));
        assert_eq!(c.get(&"b".to_string()), None);
        assert_eq!(c.get(&"c".to_string()), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_never_returned() {
        let mut c = cache(10);
        c.insert("a".into(), 1);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(c.get(&"a".to_string()), Some(1));

        // Reads refresh recency, not freshness.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(c.get(&"a".to_string()), None);
        assert!(c.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn insert_refreshes_ttl() {
        let mut c = cache(10);
        c.insert("a".into(), 1);
        tokio::time::advance(Duration::from_secs(50)).await;
        c.insert("a".into(), 2);
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(c.get(&"a".to_string()), Some(2));
        assert_eq!(c.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_make_room_before_live_ones() {
        let mut c = cache(2);
        c.insert("old".into(), 1);
        tokio::time::advance(Duration::from_secs(30)).await;
        c.insert("live".into(), 2);
        tokio::time::advance(Duration::from_secs(31)).await;

        c.insert("new".into(), 3);
        assert_eq!(c.get(&"live".to_string()), Some(2));
        assert_eq!(c.get(&"new".to_string()), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_everything() {
        let mut c = cache(5);
        c.insert("a".into(), 1);
        c.insert("b".into(), 2);
        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.get(&"a".to_string()), None);
    }

    #[test]
    fn zero_capacity_holds_one_entry() {
        let c: TtlCache<String, u32> = TtlCache::new(0, Duration::from_secs(1));
        assert_eq!(c.capacity(), 1);
    }
}
