use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use crate::error::{ChatError, Result};

const PRUNE_THRESHOLD: usize = 1024;

/// Lazily created async mutexes, one per key.
struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash> KeyedLocks<K> {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, key: K) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| ChatError::Storage(anyhow::anyhow!("Lock table poisoned: {}", e)))?;

        if locks.len() >= PRUNE_THRESHOLD {
            // Entries only referenced by the table are idle
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Ok(locks.entry(key).or_default().clone())
    }
}

/// In-process mutex per message id. Serializes translation writes and
/// priced reads of the same message; distinct messages never contend.
/// Holders only do database work, never provider calls.
pub struct MessageLocks {
    locks: KeyedLocks<i64>,
    timeout: Duration,
}

impl MessageLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: KeyedLocks::new(),
            timeout,
        }
    }

    pub async fn acquire(&self, message_id: i64) -> Result<OwnedMutexGuard<()>> {
        let lock = self.locks.entry(message_id)?;

        tokio::time::timeout(self.timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                ChatError::PersistenceConflict(format!(
                    "message {} is busy, gave up after {:?}",
                    message_id, self.timeout
                ))
            })
    }
}

/// One mutex per (message, language key) translation slot. Held across the
/// provider call that materializes the slot so concurrent readers wait for
/// the first translation instead of paying for a second one. Waiting is
/// bounded by the gateway's own timeout and retry policy.
pub struct SlotLocks {
    locks: KeyedLocks<(i64, String)>,
}

impl SlotLocks {
    pub fn new() -> Self {
        Self {
            locks: KeyedLocks::new(),
        }
    }

    pub async fn acquire(&self, message_id: i64, language_key: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = self.locks.entry((message_id, language_key.to_string()))?;
        Ok(lock.lock_owned().await)
    }
}

impl Default for SlotLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_message_times_out_while_held() {
        let locks = MessageLocks::new(Duration::from_millis(20));
        let _held = locks.acquire(7).await.unwrap();

        let err = locks.acquire(7).await.unwrap_err();
        assert!(matches!(err, ChatError::PersistenceConflict(_)));
    }

    #[tokio::test]
    async fn conflict_reports_sub_second_timeouts() {
        let locks = MessageLocks::new(Duration::from_millis(20));
        let _held = locks.acquire(7).await.unwrap();

        let err = locks.acquire(7).await.unwrap_err();
        assert!(err.to_string().contains("20ms"), "{}", err);
    }

    #[tokio::test]
    async fn distinct_messages_do_not_contend() {
        let locks = MessageLocks::new(Duration::from_millis(20));
        let _a = locks.acquire(1).await.unwrap();
        assert!(locks.acquire(2).await.is_ok());
    }

    #[tokio::test]
    async fn released_lock_can_be_reacquired() {
        let locks = MessageLocks::new(Duration::from_millis(20));
        drop(locks.acquire(3).await.unwrap());
        assert!(locks.acquire(3).await.is_ok());
    }

    #[tokio::test]
    async fn slots_of_one_message_are_independent() {
        let slots = SlotLocks::new();
        let _fr = slots.acquire(1, "fr").await.unwrap();

        let de = tokio::time::timeout(Duration::from_millis(20), slots.acquire(1, "de")).await;
        assert!(de.is_ok());

        let fr_again = tokio::time::timeout(Duration::from_millis(20), slots.acquire(1, "fr")).await;
        assert!(fr_again.is_err());
    }
}
