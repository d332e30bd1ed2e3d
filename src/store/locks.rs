//! Per-image async mutexes.
//!
//! All read-modify-write cycles on one record hold that record's lock;
//! different ids never contend.

use crate::card::ImageId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub(crate) struct KeyedLocks {
    locks: Mutex<HashMap<ImageId, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub(crate) async fn lock(&self, id: &ImageId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            // Entries nobody holds or waits on are dropped.
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        mutex.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_id_serializes() {
        let locks = Arc::new(KeyedLocks::default());
        let id = ImageId::from_bytes(b"a");

        let guard = locks.lock(&id).await;
        let l2 = Arc::clone(&locks);
        let id2 = id.clone();
        let waiter = tokio::spawn(async move {
            let _g = l2.lock(&id2).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn different_ids_do_not_contend() {
        let locks = KeyedLocks::default();
        let _a = locks.lock(&ImageId::from_bytes(b"a")).await;
        let _b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&ImageId::from_bytes(b"b")),
        )
        .await
        .expect("lock on another id must not block");
    }

    #[tokio::test]
    async fn released_entries_are_pruned() {
        let locks = KeyedLocks::default();
        for seed in 0..10u8 {
            let _g = locks.lock(&ImageId::from_bytes(&[seed])).await;
        }
        let _g = locks.lock(&ImageId::from_bytes(b"last")).await;
        assert_eq!(locks.tracked(), 1);
    }
}
