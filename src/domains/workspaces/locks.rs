use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutual exclusion keyed by project id.
///
/// One git mutation per repository at a time: concurrent worktree operations
/// on the same repo corrupt git's lock files. Different keys proceed
/// independently. No fairness beyond what the underlying mutex provides.
#[derive(Default)]
pub struct ProjectLocks {
    slots: Mutex<HashMap<String, LockSlot>>,
}

struct LockSlot {
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the key is free, then holds it until `release`.
    pub async fn acquire(&self, key: &str) {
        let lock = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(key.to_string())
                .or_insert_with(|| LockSlot {
                    lock: Arc::new(Mutex::new(())),
                    guard: None,
                })
                .lock
                .clone()
        };

        let guard = Arc::clone(&lock).lock_owned().await;

        let mut slots = self.slots.lock().await;
        let slot = slots.entry(key.to_string()).or_insert_with(|| LockSlot {
            lock: lock.clone(),
            guard: None,
        });
        slot.guard = Some(guard);
    }

    /// Releasing a key with no holder is a no-op.
    pub async fn release(&self, key: &str) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(key) {
            slot.guard = None;
            // No waiter holds a clone of the mutex: drop the slot entirely.
            if Arc::strong_count(&slot.lock) == 1 {
                slots.remove(key);
            }
        }
    }

    pub async fn has_lock(&self, key: &str) -> bool {
        let slots = self.slots.lock().await;
        slots
            .get(key)
            .map(|slot| slot.guard.is_some())
            .unwrap_or(false)
    }
}
