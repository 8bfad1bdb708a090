use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per key, created on demand and dropped once idle.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<K, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let lock = {
            let mut map = self.map();
            // Entries orphaned by a waiter cancelled mid-acquire.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(map.entry(key.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            guard: Some(guard),
            owner: self,
            key,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map().len()
    }
}

/// Held for the duration of a keyed critical section.
pub struct KeyGuard<'a, K: Eq + Hash + Clone> {
    guard: Option<OwnedMutexGuard<()>>,
    owner: &'a KeyedLocks<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.owner.map();
        // Only the map's own reference left: nobody holds or awaits this lock.
        if map
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.key);
        }
    }
}
