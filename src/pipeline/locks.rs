//! Per-conversation mutual exclusion.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per conversation key, created on first use.
///
/// Work on different conversations never contends; work on the same
/// conversation is serialized in arrival order. An entry lives only while
/// someone holds or waits on it.
#[derive(Default)]
pub struct ConversationLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. Released when the guard drops.
    pub async fn acquire(&self, key: &str) -> ConversationGuard<'_> {
        // Clone the Arc out so the map shard is not held across the await.
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        ConversationGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive access to one conversation.
///
/// Dropping it unlocks and, when no other task holds a clone of the mutex,
/// removes the map entry.
pub struct ConversationGuard<'a> {
    locks: &'a ConversationLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConversationGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // `remove_if` runs under the shard lock, and `acquire` clones under the
        // same lock, so a count of 1 means no holder or waiter exists.
        self.locks
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(ConversationLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("conv-1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.locks.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = ConversationLocks::new();
        let _a = locks.acquire("conv-a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("conv-b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn entries_are_removed_once_released() {
        let locks = ConversationLocks::new();
        let held = locks.acquire("held").await;
        drop(locks.acquire("free").await);
        assert_eq!(locks.locks.len(), 1);
        assert!(locks.locks.contains_key("held"));
        drop(held);
        assert!(locks.locks.is_empty());
    }

    #[tokio::test]
    async fn entry_survives_while_a_waiter_is_queued() {
        let locks = Arc::new(ConversationLocks::new());
        let first = locks.acquire("conv").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("conv").await;
            })
        };
        // Let the waiter clone the mutex and park on it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert!(locks.locks.contains_key("conv") || waiter.is_finished());

        waiter.await.unwrap();
        assert!(locks.locks.is_empty());
    }
}
