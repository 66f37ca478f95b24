// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded LRU map with per-entry TTL, used by the tool-result cache and the
//! permission gate's session cache.  Single mutex; not a concurrent map —
//! readers and writers contend for correctness, not throughput.
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

struct Inner<K: Eq + Hash, V> {
    map: LruCache<K, Entry<V>>,
    ttl: Duration,
}

/// Thread-safe LRU cache with TTL expiration and a cooperatively-cancellable
/// background sweeper.
pub struct TtlCache<K: Eq + Hash + Clone + Send + 'static, V: Clone + Send + 'static> {
    inner: Arc<Mutex<Inner<K, V>>>,
    closed: Arc<AtomicBool>,
}

impl<K: Eq + Hash + Clone + Send + 'static, V: Clone + Send + 'static> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + 'static, V: Clone + Send + 'static> TtlCache<K, V> {
    /// Create a new cache with the given capacity and entry TTL.  `capacity`
    /// of zero is coerced to 1 (an `LruCache` of size 0 would panic).
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                map: LruCache::new(cap),
                ttl,
            })),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Look up `key`, updating recency on hit. Returns `None` on miss or
    /// expiry (an expired entry is removed as a side effect).
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let ttl = inner.ttl;
        let expired = match inner.map.peek(key) {
            Some(e) => e.stored_at.elapsed() > ttl,
            None => return None,
        };
        if expired {
            inner.map.pop(key);
            return None;
        }
        inner.map.get(key).map(|e| e.value.clone())
    }

    /// Insert or refresh `key`, evicting the least-recently-used entry if the
    /// cache is over capacity.
    pub fn set(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.put(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn delete(&self, key: &K) {
        self.inner.lock().unwrap().map.pop(key);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().map.clear();
    }

    /// Remove every entry for which `pred` returns true.
    pub fn remove(&self, mut pred: impl FnMut(&K, &V) -> bool) {
        let mut inner = self.inner.lock().unwrap();
        let victims: Vec<K> = inner
            .map
            .iter()
            .filter(|(k, e)| pred(k, &e.value))
            .map(|(k, _)| k.clone())
            .collect();
        for k in victims {
            inner.map.pop(&k);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All non-expired keys, most-recently-used first.
    pub fn keys(&self) -> Vec<K> {
        let mut inner = self.inner.lock().unwrap();
        let ttl = inner.ttl;
        let expired: Vec<K> = inner
            .map
            .iter()
            .filter(|(_, e)| e.stored_at.elapsed() > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            inner.map.pop(k);
        }
        inner.map.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Drop every expired entry. Called by the background sweeper, and
    /// callable directly in tests without waiting on the sweep interval.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock().unwrap();
        let ttl = inner.ttl;
        let expired: Vec<K> = inner
            .map
            .iter()
            .filter(|(_, e)| e.stored_at.elapsed() > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            inner.map.pop(k);
        }
    }

    /// Spawn a background task that sweeps expired entries every `interval`.
    /// Stops as soon as [`TtlCache::close`] is called; idempotent.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if cache.closed.load(Ordering::Acquire) {
                    break;
                }
                cache.sweep();
            }
        })
    }

    /// Stop the background sweeper. Idempotent — safe to call more than once
    /// or when no sweeper was ever spawned.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Sweep interval used by the tool-result cache and permission session cache.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_hits() {
        let c: TtlCache<String, String> = TtlCache::new(10, Duration::from_secs(60));
        c.set("k".into(), "v".into());
        assert_eq!(c.get(&"k".to_string()), Some("v".to_string()));
    }

    #[test]
    fn get_miss_for_unknown_key() {
        let c: TtlCache<String, String> = TtlCache::new(10, Duration::from_secs(60));
        assert_eq!(c.get(&"missing".to_string()), None);
    }

    #[test]
    fn ttl_expiry_produces_miss_and_removes_entry() {
        let c: TtlCache<String, String> = TtlCache::new(10, Duration::from_millis(10));
        c.set("k".into(), "v".into());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(c.get(&"k".to_string()), None);
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn lru_eviction_drops_oldest_after_capacity_plus_one() {
        let c: TtlCache<i32, i32> = TtlCache::new(2, Duration::from_secs(60));
        c.set(1, 1);
        c.set(2, 2);
        c.set(3, 3);
        assert_eq!(c.get(&1), None, "first key should have been evicted");
        assert_eq!(c.get(&2), Some(2));
        assert_eq!(c.get(&3), Some(3));
    }

    #[test]
    fn get_updates_recency_protecting_from_eviction() {
        let c: TtlCache<i32, i32> = TtlCache::new(2, Duration::from_secs(60));
        c.set(1, 1);
        c.set(2, 2);
        let _ = c.get(&1); // touch 1, making 2 the LRU victim
        c.set(3, 3);
        assert_eq!(c.get(&2), None);
        assert_eq!(c.get(&1), Some(1));
        assert_eq!(c.get(&3), Some(3));
    }

    #[test]
    fn delete_removes_entry() {
        let c: TtlCache<String, String> = TtlCache::new(10, Duration::from_secs(60));
        c.set("k".into(), "v".into());
        c.delete(&"k".to_string());
        assert_eq!(c.get(&"k".to_string()), None);
    }

    #[test]
    fn clear_empties_cache() {
        let c: TtlCache<i32, i32> = TtlCache::new(10, Duration::from_secs(60));
        c.set(1, 1);
        c.set(2, 2);
        c.clear();
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn remove_by_predicate() {
        let c: TtlCache<String, i32> = TtlCache::new(10, Duration::from_secs(60));
        c.set("/a/b".into(), 1);
        c.set("/a/c".into(), 2);
        c.set("/x/y".into(), 3);
        c.remove(|k, _| k.starts_with("/a/"));
        assert_eq!(c.len(), 1);
        assert_eq!(c.get(&"/x/y".to_string()), Some(3));
    }

    #[test]
    fn keys_excludes_expired_entries() {
        let c: TtlCache<i32, i32> = TtlCache::new(10, Duration::from_millis(10));
        c.set(1, 1);
        std::thread::sleep(Duration::from_millis(30));
        c.set(2, 2);
        let keys = c.keys();
        assert!(!keys.contains(&1));
        assert!(keys.contains(&2));
    }

    #[test]
    fn sweep_drops_only_expired() {
        let c: TtlCache<i32, i32> = TtlCache::new(10, Duration::from_millis(10));
        c.set(1, 1);
        std::thread::sleep(Duration::from_millis(30));
        c.set(2, 2);
        c.sweep();
        assert_eq!(c.len(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let c: TtlCache<i32, i32> = TtlCache::new(10, Duration::from_secs(60));
        c.close();
        c.close();
    }

    #[tokio::test]
    async fn spawned_sweeper_stops_after_close() {
        let c: TtlCache<i32, i32> = TtlCache::new(10, Duration::from_millis(5));
        let handle = c.spawn_sweeper(Duration::from_millis(5));
        c.set(1, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        c.close();
        let _ = handle.await;
    }
}
