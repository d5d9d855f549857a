//! Bounded pool of background asset refresh workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::assets::fetcher::AssetFetcher;

/// Background refreshes are queued here instead of spawned one by one, so
/// shutdown can wait for everything that was accepted.
pub struct RefreshPool {
  tx: Mutex<Option<mpsc::Sender<String>>>,
  workers: Mutex<Vec<JoinHandle<()>>>,
  completed: Arc<AtomicUsize>,
}

impl RefreshPool {
  /// Start `workers` refresh tasks. Must be called inside a Tokio runtime.
  pub fn new(fetcher: AssetFetcher, workers: usize, capacity: usize) -> Self {
    let (tx, rx) = mpsc::channel::<String>(capacity.max(1));
    let rx = Arc::new(AsyncMutex::new(rx));
    let completed = Arc::new(AtomicUsize::new(0));

    let handles = (0..workers.max(1))
      .map(|worker| {
        let rx = Arc::clone(&rx);
        let fetcher = fetcher.clone();
        let completed = Arc::clone(&completed);
        tokio::spawn(async move {
          loop {
            let next = rx.lock().await.recv().await;
            let Some(uri) = next else { break };
            match fetcher.fetch_asset(&uri, true).await {
              Ok(Some(_)) => debug!(worker, uri = %uri, "background refresh finished"),
              Ok(None) => warn!(worker, uri = %uri, "background refresh produced no content"),
              Err(e) => warn!(worker, uri = %uri, error = %e, "background refresh rejected uri"),
            }
            completed.fetch_add(1, Ordering::SeqCst);
          }
        })
      })
      .collect();

    Self {
      tx: Mutex::new(Some(tx)),
      workers: Mutex::new(handles),
      completed,
    }
  }

  /// Queue a refresh. Returns false when the queue is full or the pool is
  /// shut down; the refresh is dropped in that case.
  pub fn schedule(&self, uri: &str) -> bool {
    let guard = match self.tx.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    let Some(tx) = guard.as_ref() else {
      warn!(uri, "refresh pool is shut down, dropping refresh");
      return false;
    };
    match tx.try_send(uri.to_string()) {
      Ok(()) => true,
      Err(mpsc::error::TrySendError::Full(_)) => {
        warn!(uri, "refresh queue is full, dropping refresh");
        false
      }
      Err(mpsc::error::TrySendError::Closed(_)) => {
        warn!(uri, "refresh queue is closed, dropping refresh");
        false
      }
    }
  }

  /// Refreshes finished so far, successful or not.
  pub fn completed(&self) -> usize {
    self.completed.load(Ordering::SeqCst)
  }

  /// Stop accepting work, let the workers drain the queue, and wait for them.
  pub async fn shutdown(&self) {
    let tx = match self.tx.lock() {
      Ok(mut guard) => guard.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    };
    drop(tx);

    let handles = match self.workers.lock() {
      Ok(mut guard) => std::mem::take(&mut *guard),
      Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    let count = handles.len();
    for handle in handles {
      if let Err(e) = handle.await {
        warn!(error = %e, "refresh worker panicked");
      }
    }
    if count > 0 {
      info!(workers = count, completed = self.completed(), "refresh pool stopped");
    }
  }
}
