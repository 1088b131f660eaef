//! String-keyed async mutex
//!
//! Each key owns its own `tokio::sync::Mutex`, created lazily on first use and
//! dropped once nobody holds or waits on it. Unrelated keys never contend.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    // holders + waiters
    refs: usize,
}

#[derive(Default)]
pub struct NamedAsyncMutex {
    slots: Mutex<HashMap<String, Slot>>,
}

/// Keeps a key's slot alive; the last reference removes it from the map.
struct SlotRef<'a> {
    owner: &'a NamedAsyncMutex,
    key: String,
}

impl Drop for SlotRef<'_> {
    fn drop(&mut self) {
        let mut slots = self.owner.slots.lock();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

/// Held lock for one key. Field order matters: the lock is released before the
/// slot reference is dropped.
pub struct NamedGuard<'a> {
    _guard: OwnedMutexGuard<()>,
    slot: SlotRef<'a>,
}

impl NamedGuard<'_> {
    pub fn key(&self) -> &str {
        &self.slot.key
    }
}

impl NamedAsyncMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire_slot(&self, key: &str) -> (Arc<tokio::sync::Mutex<()>>, SlotRef<'_>) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            refs: 0,
        });
        slot.refs += 1;
        let lock = slot.lock.clone();
        (
            lock,
            SlotRef {
                owner: self,
                key: key.to_string(),
            },
        )
    }

    /// Wait for exclusive access to `key`. Cancel-safe: dropping the future
    /// while waiting releases the slot reference.
    pub async fn lock(&self, key: &str) -> NamedGuard<'_> {
        let (lock, slot) = self.acquire_slot(key);
        let guard = lock.lock_owned().await;
        NamedGuard {
            _guard: guard,
            slot,
        }
    }

    pub fn try_lock(&self, key: &str) -> Option<NamedGuard<'_>> {
        let (lock, slot) = self.acquire_slot(key);
        match lock.try_lock_owned() {
            Ok(guard) => Some(NamedGuard {
                _guard: guard,
                slot,
            }),
            Err(_) => None,
        }
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.slots.lock().len()
    }
}
