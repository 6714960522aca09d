//! Per-key async locks

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;

/// Registry of per-key async mutexes
///
/// A slot exists only while someone holds or waits for it.
#[derive(Default)]
pub(crate) struct KeyLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

impl KeyLocks {
    /// Wait for exclusive access to `key`
    ///
    /// Dropping the returned guard, or the future while it still waits,
    /// releases the slot.
    pub(crate) async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let handle = SlotHandle {
            locks: self,
            key: key.to_string(),
            slot: self.slots.lock().entry(key.to_string()).or_default().clone(),
        };
        let guard = handle.slot.clone().lock_owned().await;

        KeyGuard {
            _guard: guard,
            _handle: handle,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Exclusive access to one key
pub(crate) struct KeyGuard<'a> {
    // Dropped before the handle so the handle sees the final reference count
    _guard: OwnedMutexGuard<()>,
    _handle: SlotHandle<'a>,
}

struct SlotHandle<'a> {
    locks: &'a KeyLocks,
    key: String,
    slot: Slot,
}

impl Drop for SlotHandle<'_> {
    fn drop(&mut self) {
        let mut slots = self.locks.slots.lock();
        // Only the registry and this handle left
        if Arc::strong_count(&self.slot) <= 2 {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_slot_removed_after_release() {
        let locks = KeyLocks::default();
        {
            let _guard = locks.lock("a").await;
            assert_eq!(locks.len(), 1);
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let locks = KeyLocks::default();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_slot() {
        let locks = KeyLocks::default();
        let holder = locks.lock("k").await;

        let waited = tokio::time::timeout(Duration::from_millis(50), locks.lock("k")).await;
        assert!(waited.is_err());
        assert_eq!(locks.len(), 1);

        drop(holder);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_holder() {
        let locks = Arc::new(KeyLocks::default());
        let holder = locks.lock("k").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("k").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(holder);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }
}
