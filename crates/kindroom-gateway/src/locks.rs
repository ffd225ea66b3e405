use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use kindroom_types::models::UserId;

/// Per-user mutual exclusion. Two messages from the same user never update
/// that user's row at the same time; different users never wait on each other.
#[derive(Clone, Default)]
pub struct UserLocks {
    locks: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
}

/// Held for the read-modify-write of one user. Releases on drop.
pub struct UserGuard {
    user_id: UserId,
    locks: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, user_id: UserId) -> UserGuard {
        let lock = self.locks.entry(user_id).or_default().clone();
        let guard = lock.lock_owned().await;
        UserGuard {
            user_id,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Users with a held or awaited lock.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own reference left: nobody holds or waits on it.
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
