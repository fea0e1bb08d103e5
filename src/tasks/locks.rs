use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::pacing::{CancelToken, Cancelled};

/// One async mutex per phone. Workflows on the same account never overlap.
#[derive(Default)]
pub struct AccountLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the account, giving up as soon as `cancel` fires.
    pub async fn acquire(&self, phone: &str, cancel: &CancelToken) -> Result<OwnedMutexGuard<()>, Cancelled> {
        let lock = self.entry(phone);
        cancel.guard(lock.lock_owned()).await
    }

    /// Returns `None` instead of waiting when the account is busy.
    pub fn try_acquire(&self, phone: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(phone).try_lock_owned().ok()
    }

    /// Phones with a lock that is held or waited on.
    pub fn tracked(&self) -> usize {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut map);
        map.len()
    }

    fn entry(&self, phone: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut map);
        map.entry(phone.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

// Guards and waiters hold a clone; an entry only the map references is idle.
// Clones are only taken under the map mutex, so this cannot race a new waiter.
fn prune(map: &mut HashMap<String, Arc<AsyncMutex<()>>>) {
    map.retain(|_, lock| Arc::strong_count(lock) > 1);
}
