//! Offline mode: which operations may run without the remote, and a queue
//! of deferred sync work replayed when connectivity returns.

use color_eyre::Result;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::monitor::{ConnectivityMonitor, ConnectivityStatus};

/// Operations callers ask permission for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
  LoadCachedAsset,
  CreateInstance,
  EditInstance,
  DeleteInstance,
  FetchAsset,
  SyncInstance,
  CheckVersions,
}

impl Operation {
  /// Purely local operations.
  pub fn is_offline_capable(&self) -> bool {
    matches!(
      self,
      Self::LoadCachedAsset | Self::CreateInstance | Self::EditInstance | Self::DeleteInstance
    )
  }
}

/// A unit of sync work that can wait for connectivity.
pub struct DeferredTask {
  name: String,
  run: Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,
}

impl DeferredTask {
  pub fn new<F>(name: impl Into<String>, run: F) -> Self
  where
    F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
  {
    Self {
      name: name.into(),
      run: Box::new(run),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  async fn execute(self) {
    let name = self.name;
    match (self.run)().await {
      Ok(()) => debug!(task = %name, "deferred task finished"),
      Err(e) => warn!(task = %name, error = %e, "deferred task failed"),
    }
  }
}

impl fmt::Debug for DeferredTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DeferredTask").field("name", &self.name).finish()
  }
}

/// What `queue_sync_task` did with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
  Executed,
  Queued,
}

/// Follows the connectivity monitor and holds sync work while offline.
///
/// Queued tasks are drained once, in order, on the next transition to
/// ONLINE. Failures are logged and not re-queued.
pub struct OfflineManager {
  status: watch::Receiver<ConnectivityStatus>,
  pending: AsyncMutex<Vec<DeferredTask>>,
  listener: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineManager {
  pub fn new(monitor: &ConnectivityMonitor) -> Arc<Self> {
    Arc::new(Self {
      status: monitor.subscribe(),
      pending: AsyncMutex::new(Vec::new()),
      listener: Mutex::new(None),
    })
  }

  pub fn status(&self) -> ConnectivityStatus {
    *self.status.borrow()
  }

  pub fn is_offline(&self) -> bool {
    self.status() == ConnectivityStatus::Offline
  }

  pub fn can_perform_operation(&self, operation: Operation) -> bool {
    operation.is_offline_capable() || !self.is_offline()
  }

  /// Run `task` now when connected, otherwise hold it until the next
  /// transition to ONLINE.
  pub async fn queue_sync_task(&self, task: DeferredTask) -> TaskDisposition {
    let mut pending = self.pending.lock().await;
    if self.is_offline() {
      info!(task = %task.name(), queued = pending.len() + 1, "offline, deferring task");
      pending.push(task);
      return TaskDisposition::Queued;
    }
    drop(pending);
    task.execute().await;
    TaskDisposition::Executed
  }

  /// Always queue, whatever the current status. Used for retries after a
  /// network failure so the retry cannot run in the same breath.
  pub async fn defer(&self, task: DeferredTask) {
    let mut pending = self.pending.lock().await;
    info!(task = %task.name(), queued = pending.len() + 1, "deferring task until reconnect");
    pending.push(task);
  }

  /// Like [`defer`](Self::defer), but skips a task whose name is already
  /// queued. Returns whether the task was queued.
  pub async fn defer_once(&self, task: DeferredTask) -> bool {
    let mut pending = self.pending.lock().await;
    if pending.iter().any(|queued| queued.name == task.name) {
      debug!(task = %task.name(), "task already deferred");
      return false;
    }
    info!(task = %task.name(), queued = pending.len() + 1, "deferring task until reconnect");
    pending.push(task);
    true
  }

  pub async fn pending_count(&self) -> usize {
    self.pending.lock().await.len()
  }

  /// Execute and remove every queued task. Returns how many ran.
  pub async fn drain_pending(&self) -> usize {
    let tasks = std::mem::take(&mut *self.pending.lock().await);
    let count = tasks.len();
    if count > 0 {
      info!(tasks = count, "replaying deferred tasks");
    }
    for task in tasks {
      task.execute().await;
    }
    count
  }

  /// React to a status change. Only ONLINE drains the queue.
  pub async fn handle_transition(&self, status: ConnectivityStatus) -> usize {
    match status {
      ConnectivityStatus::Online => self.drain_pending().await,
      other => {
        debug!(status = %other, "connectivity changed, keeping queue");
        0
      }
    }
  }

  /// Start following the monitor. Replaces any previous listener.
  pub fn attach(self: &Arc<Self>) {
    let manager: Weak<Self> = Arc::downgrade(self);
    let mut rx = self.status.clone();
    let handle = tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let status = *rx.borrow_and_update();
        let Some(manager) = manager.upgrade() else {
          break;
        };
        manager.handle_transition(status).await;
      }
    });

    let previous = match self.listener.lock() {
      Ok(mut listener) => listener.replace(handle),
      Err(poisoned) => poisoned.into_inner().replace(handle),
    };
    if let Some(previous) = previous {
      previous.abort();
    }
  }

  /// Stop following the monitor. Queued tasks stay queued.
  pub fn detach(&self) {
    let handle = match self.listener.lock() {
      Ok(mut listener) => listener.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(handle) = handle {
      handle.abort();
    }
  }
}

impl Drop for OfflineManager {
  fn drop(&mut self) {
    self.detach();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ConnectivityConfig;
  use crate::connectivity::monitor::{HealthProbe, ProbeFailure};
  use async_trait::async_trait;
  use color_eyre::eyre::eyre;
  use futures::FutureExt;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  struct NeverProbe;

  #[async_trait]
  impl HealthProbe for NeverProbe {
    async fn probe(&self) -> std::result::Result<(), ProbeFailure> {
      Err(ProbeFailure::Timeout)
    }
  }

  fn monitor() -> ConnectivityMonitor {
    ConnectivityMonitor::new(Arc::new(NeverProbe), &ConnectivityConfig::default())
  }

  fn counting_task(counter: &Arc<AtomicUsize>) -> DeferredTask {
    let counter = Arc::clone(counter);
    DeferredTask::new("count", move || {
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<(), color_eyre::Report>(())
      }
      .boxed()
    })
  }

  #[test]
  fn test_offline_capable_operations() {
    let monitor = monitor();
    let manager = OfflineManager::new(&monitor);
    assert!(manager.is_offline());
    assert!(manager.can_perform_operation(Operation::LoadCachedAsset));
    assert!(manager.can_perform_operation(Operation::EditInstance));
    assert!(!manager.can_perform_operation(Operation::SyncInstance));

    monitor.record_success();
    assert!(manager.can_perform_operation(Operation::SyncInstance));
  }

  #[tokio::test]
  async fn test_queued_task_runs_once_on_reconnect() {
    let monitor = monitor();
    let manager = OfflineManager::new(&monitor);
    manager.attach();

    let counter = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    let sink = Arc::clone(&counter);
    let task = DeferredTask::new("sync ticket/1", move || {
      async move {
        sink.fetch_add(1, Ordering::SeqCst);
        let _ = done_tx.send(());
        Ok::<(), color_eyre::Report>(())
      }
      .boxed()
    });

    assert_eq!(manager.queue_sync_task(task).await, TaskDisposition::Queued);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(manager.pending_count().await, 1);

    monitor.record_success();
    tokio::time::timeout(Duration::from_secs(2), done_rx)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(manager.pending_count().await, 0);

    // A later flap must not replay it.
    for _ in 0..3 {
      monitor.record_failure(&ProbeFailure::Timeout);
    }
    monitor.record_success();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_online_executes_immediately_and_failures_are_dropped() {
    let monitor = monitor();
    monitor.record_success();
    let manager = OfflineManager::new(&monitor);
    let counter = Arc::new(AtomicUsize::new(0));

    assert_eq!(
      manager.queue_sync_task(counting_task(&counter)).await,
      TaskDisposition::Executed
    );
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    manager
      .defer(DeferredTask::new("boom", || async { Err::<(), _>(eyre!("remote down")) }.boxed()))
      .await;
    manager.defer(counting_task(&counter)).await;
    assert_eq!(manager.pending_count().await, 2);
    assert_eq!(manager.handle_transition(ConnectivityStatus::Degraded).await, 0);
    assert_eq!(manager.handle_transition(ConnectivityStatus::Online).await, 2);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(manager.pending_count().await, 0);
  }

  #[tokio::test]
  async fn test_defer_once_skips_duplicate_names() {
    let monitor = monitor();
    let manager = OfflineManager::new(&monitor);
    let counter = Arc::new(AtomicUsize::new(0));

    assert!(manager.defer_once(counting_task(&counter)).await);
    assert!(!manager.defer_once(counting_task(&counter)).await);
    assert_eq!(manager.pending_count().await, 1);
    assert_eq!(manager.drain_pending().await, 1);
    assert!(manager.defer_once(counting_task(&counter)).await);
  }
}
