//! In-process advisory locks keyed by string.
//!
//! Serializes work on one resource (an asset URI, an instance) inside a single
//! process. Nothing here coordinates between processes sharing a data root.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedLocks {
  locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait for exclusive access to `key`. The lock is held until the guard is
  /// dropped.
  pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
    let entry = {
      let mut locks = match self.locks.lock() {
        Ok(locks) => locks,
        Err(poisoned) => poisoned.into_inner(),
      };
      // Entries nobody holds or waits on are dropped as we go.
      locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
      Arc::clone(locks.entry(key.to_string()).or_default())
    };
    entry.lock_owned().await
  }

  pub fn len(&self) -> usize {
    self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn test_same_key_is_serialized() {
    let locks = Arc::new(KeyedLocks::new());
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
      let locks = Arc::clone(&locks);
      let active = Arc::clone(&active);
      let peak = Arc::clone(&peak);
      handles.push(tokio::spawn(async move {
        let _guard = locks.lock("ticket/42").await;
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        active.fetch_sub(1, Ordering::SeqCst);
      }));
    }
    for handle in handles {
      handle.await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_different_keys_do_not_block() {
    let locks = KeyedLocks::new();
    let _a = locks.lock("a").await;
    let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
    assert!(b.is_ok());
  }

  #[tokio::test]
  async fn test_released_entries_are_pruned() {
    let locks = KeyedLocks::new();
    drop(locks.lock("a").await);
    drop(locks.lock("b").await);
    let _c = locks.lock("c").await;
    assert_eq!(locks.len(), 1);
  }
}
