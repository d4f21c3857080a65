//! Per-note async mutexes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Serializes mutations of one note; different ids never contend.
#[derive(Default)]
pub(crate) struct NoteLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held lock on one note. Dropping it unlocks and forgets the entry when no
/// one else holds or awaits it.
pub(crate) struct NoteLockGuard<'a> {
    locks: &'a NoteLocks,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NoteLockGuard<'_> {
    fn drop(&mut self) {
        // Unlock first so our own Arc no longer counts.
        self.guard.take();
        self.locks.release(&self.id);
    }
}

impl NoteLocks {
    pub(crate) async fn lock(&self, id: &str) -> NoteLockGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        NoteLockGuard {
            locks: self,
            id: id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn release(&self, id: &str) {
        let mut locks = self.locks.lock();
        if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(id);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_exclusive() {
        let locks = Arc::new(NoteLocks::default());
        let guard = locks.lock("a").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("a").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_different_ids_do_not_contend() {
        let locks = NoteLocks::default();
        let _a = locks.lock("a").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b"))
            .await
            .expect("lock on another id must not block");
        assert_eq!(locks.tracked(), 2);
    }

    #[tokio::test]
    async fn test_entry_kept_while_another_waiter_holds_it() {
        let locks = Arc::new(NoteLocks::default());
        let guard = locks.lock("a").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("a").await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);
        assert_eq!(locks.tracked(), 1);

        waiter.await.unwrap();
        assert_eq!(locks.tracked(), 0);
    }

    async fn fail_while_locked(locks: &NoteLocks) -> Result<(), Error> {
        let _guard = locks.lock("a").await;
        Err(Error::Consistency("write failed".to_string()))
    }

    #[tokio::test]
    async fn test_error_return_releases_entry() {
        let locks = NoteLocks::default();
        assert!(fail_while_locked(&locks).await.is_err());
        assert_eq!(locks.tracked(), 0);
    }
}
