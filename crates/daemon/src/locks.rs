//! Keyed mutexes.
//!
//! Entries exist only while someone holds or waits for the key, so the map
//! does not grow with the number of distinct keys ever seen.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, OwnedMutexGuard};

type Slots<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

pub struct NamedMutex<K> {
    slots: Slots<K>,
}

impl<K> Default for NamedMutex<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> NamedMutex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Arc<AsyncMutex<()>> {
        self.slots.lock().entry(key.clone()).or_default().clone()
    }

    /// Waits until `key` is free and takes it.
    pub async fn lock(&self, key: K) -> NamedGuard<K> {
        let mut named = NamedGuard {
            key: key.clone(),
            slots: self.slots.clone(),
            guard: None,
        };
        // Declared after `named` so a cancelled wait drops the slot reference
        // before the guard cleans up.
        let acquire = self.slot(&key).lock_owned();
        named.guard = Some(acquire.await);
        named
    }

    /// Takes `key` if nobody holds it.
    pub fn try_lock(&self, key: K) -> Option<NamedGuard<K>> {
        let slot = self.slot(&key);
        let guard = slot.try_lock_owned().ok();
        let named = NamedGuard {
            key,
            slots: self.slots.clone(),
            guard,
        };
        named.guard.is_some().then_some(named)
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a key of a [`NamedMutex`] until dropped.
pub struct NamedGuard<K: Eq + Hash> {
    key: K,
    slots: Slots<K>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for NamedGuard<K> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(&self.key) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.key);
            }
        }
    }
}

/// A lock whose acquisition gives up after a fixed timeout.
pub struct TimedLock {
    inner: AsyncMutex<()>,
    timeout: Duration,
}

impl TimedLock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: AsyncMutex::new(()),
            timeout,
        }
    }

    pub async fn acquire(&self) -> Option<MutexGuard<'_, ()>> {
        tokio::time::timeout(self.timeout, self.inner.lock()).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_lock_respects_holder_and_keys_are_independent() {
        let locks: NamedMutex<(u64, &str)> = NamedMutex::new();
        let held = locks.lock((1, "banner")).await;
        assert!(locks.try_lock((1, "banner")).is_none());
        assert!(locks.try_lock((1, "ssh")).is_some());
        assert!(locks.try_lock((2, "banner")).is_some());
        drop(held);
        assert!(locks.try_lock((1, "banner")).is_some());
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_release() {
        let locks = Arc::new(NamedMutex::<String>::new());
        let first = locks.lock("s".into()).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("s".into()).await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(locks.len(), 1);
        drop(first);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_wait_does_not_leak_slot() {
        let locks = NamedMutex::<u8>::new();
        let held = locks.lock(7).await;
        let attempt = tokio::time::timeout(Duration::from_millis(10), locks.lock(7)).await;
        assert!(attempt.is_err());
        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn timed_lock_gives_up() {
        let lock = TimedLock::new(Duration::from_millis(10));
        let held = lock.acquire().await;
        assert!(held.is_some());
        assert!(lock.acquire().await.is_none());
    }
}
