//! Keyed caches for expensive grid and file computations
//!
//! Every resolver in the crate owns a [`KeyedCache`] rather than relying on
//! shared global state. The cache guarantees that a value is computed at most
//! once per key, even when several threads ask for the same key at the same
//! time: the first caller computes while later callers block on the key's slot
//! and then reuse the stored value.
//!
//! Failed computations are not stored, so a later request retries.
//!
//! ```rust
//! use emis2ctm_core::cache::{CachePolicy, KeyedCache};
//!
//! let cache: KeyedCache<u32, String> = KeyedCache::new("example", CachePolicy::Unbounded);
//! let value = cache
//!     .get_or_try_insert_with(1, || Ok("one".to_string()))
//!     .unwrap();
//! assert_eq!(value.as_str(), "one");
//! assert_eq!(cache.stats().computed, 1);
//! ```

use crate::errors::EmissionResult;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Size policy for a [`KeyedCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Keep every entry for the lifetime of the cache
    #[default]
    Unbounded,
    /// Keep at most this many entries, evicting the oldest first
    MaxEntries(usize),
}

/// Counters describing cache usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Requests served from a stored value
    pub hits: u64,
    /// Values computed (successfully) by the cache
    pub computed: u64,
    /// Entries currently held
    pub entries: usize,
}

type Slot<V> = Arc<Mutex<Option<Arc<V>>>>;

struct CacheState<K, V> {
    slots: HashMap<K, Slot<V>>,
    order: VecDeque<K>,
    hits: u64,
    computed: u64,
}

/// A key → value store that computes each value at most once
pub struct KeyedCache<K, V> {
    name: &'static str,
    policy: CachePolicy,
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(name: &'static str, policy: CachePolicy) -> Self {
        Self {
            name,
            policy,
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                order: VecDeque::new(),
                hits: 0,
                computed: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Return the cached value for `key`, computing it with `init` if needed.
    ///
    /// The map lock is only held while locating the key's slot; `init` runs
    /// under the slot's own lock so unrelated keys are computed independently.
    pub fn get_or_try_insert_with<F>(&self, key: K, init: F) -> EmissionResult<Arc<V>>
    where
        F: FnOnce() -> EmissionResult<V>,
    {
        let slot = self.slot(key.clone());

        let mut guard = slot.lock().expect("Cache slot lock poisoned");
        if let Some(value) = guard.as_ref() {
            self.state.lock().expect("Cache lock poisoned").hits += 1;
            return Ok(Arc::clone(value));
        }

        let value = match init() {
            Ok(value) => Arc::new(value),
            Err(e) => {
                self.discard(&key, &slot);
                return Err(e);
            }
        };
        *guard = Some(Arc::clone(&value));
        drop(guard);

        self.commit(key, slot);
        trace!(cache = self.name, "computed cache entry");
        Ok(value)
    }

    /// Return the stored value for `key` without computing anything
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let slot = {
            let state = self.state.lock().expect("Cache lock poisoned");
            state.slots.get(key).cloned()
        }?;
        let guard = slot.lock().expect("Cache slot lock poisoned");
        guard.as_ref().map(Arc::clone)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("Cache lock poisoned");
        CacheStats {
            hits: state.hits,
            computed: state.computed,
            entries: state.slots.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("Cache lock poisoned").slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every stored entry
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("Cache lock poisoned");
        state.slots.clear();
        state.order.clear();
    }

    /// Forget an empty slot so it does not count towards the size limit.
    ///
    /// The slot is only removed while it is still the one stored for `key`.
    fn discard(&self, key: &K, slot: &Slot<V>) {
        let mut state = self.state.lock().expect("Cache lock poisoned");
        if state.slots.get(key).is_some_and(|stored| Arc::ptr_eq(stored, slot)) {
            state.slots.remove(key);
            state.order.retain(|k| k != key);
        }
    }

    fn slot(&self, key: K) -> Slot<V> {
        let mut state = self.state.lock().expect("Cache lock poisoned");
        if let Some(slot) = state.slots.get(&key) {
            return Arc::clone(slot);
        }

        let slot: Slot<V> = Arc::new(Mutex::new(None));
        state.slots.insert(key.clone(), Arc::clone(&slot));
        state.order.push_back(key);
        slot
    }

    /// Record a computed value and apply the size policy.
    ///
    /// A slot discarded by a failed caller while this one was waiting is
    /// registered again.
    fn commit(&self, key: K, slot: Slot<V>) {
        let mut state = self.state.lock().expect("Cache lock poisoned");
        state.computed += 1;
        if !state.slots.contains_key(&key) {
            state.slots.insert(key.clone(), slot);
            state.order.push_back(key);
        }

        if let CachePolicy::MaxEntries(max) = self.policy {
            // Evicted slots stay valid for callers already holding them
            while state.slots.len() > max.max(1) {
                match state.order.pop_front() {
                    Some(oldest) => {
                        state.slots.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
    }
}

impl<K, V> std::fmt::Debug for KeyedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedCache")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EmissionError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_value_computed_once() {
        let cache: KeyedCache<&str, usize> = KeyedCache::new("test", CachePolicy::Unbounded);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_try_insert_with("a", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .unwrap();
            assert_eq!(*value, 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.computed, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache: KeyedCache<u8, u8> = KeyedCache::new("test", CachePolicy::Unbounded);

        let failed = cache.get_or_try_insert_with(1, || {
            Err(EmissionError::MissingConfiguration("nope".to_string()))
        });
        assert!(failed.is_err());
        assert!(cache.get(&1).is_none());

        let value = cache.get_or_try_insert_with(1, || Ok(7)).unwrap();
        assert_eq!(*value, 7);
        assert_eq!(cache.stats().computed, 1);
    }

    #[test]
    fn test_failed_key_does_not_evict_stored_entries() {
        let cache: KeyedCache<u8, u8> = KeyedCache::new("test", CachePolicy::MaxEntries(1));
        cache.get_or_try_insert_with(0, || Ok(10)).unwrap();

        for key in 1..4u8 {
            let failed = cache.get_or_try_insert_with(key, || {
                Err(EmissionError::MissingConfiguration("nope".to_string()))
            });
            assert!(failed.is_err());
        }

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&0).as_deref(), Some(&10));
        assert_eq!(cache.stats().computed, 1);
    }

    #[test]
    fn test_max_entries_evicts_oldest() {
        let cache: KeyedCache<u8, u8> = KeyedCache::new("test", CachePolicy::MaxEntries(2));
        for key in 0..3u8 {
            cache.get_or_try_insert_with(key, || Ok(key)).unwrap();
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&0).is_none());
        assert_eq!(cache.get(&2).as_deref(), Some(&2));
    }

    #[test]
    fn test_concurrent_requests_coalesce() {
        let cache: KeyedCache<u8, u64> = KeyedCache::new("test", CachePolicy::Unbounded);
        let calls = AtomicUsize::new(0);
        let barrier = Barrier::new(8);

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    barrier.wait();
                    let value = cache
                        .get_or_try_insert_with(5, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(20));
                            Ok(99)
                        })
                        .unwrap();
                    assert_eq!(*value, 99);
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 7);
    }
}
