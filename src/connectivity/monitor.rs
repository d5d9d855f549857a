//! Connectivity state machine driven by periodic health probes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConnectivityConfig;
use crate::remote::SyncClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
  Online,
  Degraded,
  Offline,
}

impl fmt::Display for ConnectivityStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Online => "online",
      Self::Degraded => "degraded",
      Self::Offline => "offline",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
  pub status: ConnectivityStatus,
  pub last_check: Option<DateTime<Utc>>,
  pub consecutive_failures: u32,
  pub last_error: Option<String>,
}

impl Default for ConnectivityState {
  fn default() -> Self {
    Self {
      status: ConnectivityStatus::Offline,
      last_check: None,
      consecutive_failures: 0,
      last_error: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
  #[error("health check timed out")]
  Timeout,
  #[error("health endpoint unreachable: {0}")]
  Unreachable(String),
  #[error("health check returned HTTP {0}")]
  BadStatus(u16),
}

impl ProbeFailure {
  /// Timeouts and transport failures, as opposed to an answer with a bad
  /// status code.
  pub fn is_timeout_class(&self) -> bool {
    matches!(self, Self::Timeout | Self::Unreachable(_))
  }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
  async fn probe(&self) -> Result<(), ProbeFailure>;
}

/// GET against the remote health endpoint.
pub struct HttpHealthProbe {
  client: SyncClient,
  path: String,
  timeout: Duration,
}

impl HttpHealthProbe {
  pub fn new(client: SyncClient, config: &ConnectivityConfig) -> Self {
    Self {
      client,
      path: config.health_path.clone(),
      timeout: Duration::from_secs(config.timeout_secs.max(1)),
    }
  }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
  async fn probe(&self) -> Result<(), ProbeFailure> {
    let request = self
      .client
      .get_request(&self.path, self.timeout)
      .map_err(|e| ProbeFailure::Unreachable(e.to_string()))?;
    match request.send().await {
      Ok(response) if response.status().is_success() => Ok(()),
      Ok(response) => Err(ProbeFailure::BadStatus(response.status().as_u16())),
      Err(e) if e.is_timeout() => Err(ProbeFailure::Timeout),
      Err(e) => Err(ProbeFailure::Unreachable(e.to_string())),
    }
  }
}

pub type TransitionCallback = Box<dyn Fn(ConnectivityStatus, ConnectivityStatus) + Send + Sync>;

/// Tracks whether the remote is reachable.
///
/// Starts OFFLINE. A success flips to ONLINE at once; failures only change
/// the status after `failure_threshold` in a row. At the threshold,
/// timeout-class failures mean OFFLINE and bad HTTP statuses mean DEGRADED.
pub struct ConnectivityMonitor {
  probe: Arc<dyn HealthProbe>,
  interval: Duration,
  failure_threshold: u32,
  state: Mutex<ConnectivityState>,
  status_tx: watch::Sender<ConnectivityStatus>,
  callbacks: Mutex<Vec<TransitionCallback>>,
  stop: Arc<Notify>,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
  pub fn new(probe: Arc<dyn HealthProbe>, config: &ConnectivityConfig) -> Self {
    let (status_tx, _) = watch::channel(ConnectivityStatus::Offline);
    Self {
      probe,
      interval: Duration::from_secs(config.check_interval_secs.max(1)),
      failure_threshold: config.failure_threshold.max(1),
      state: Mutex::new(ConnectivityState::default()),
      status_tx,
      callbacks: Mutex::new(Vec::new()),
      stop: Arc::new(Notify::new()),
      task: Mutex::new(None),
    }
  }

  pub fn state(&self) -> ConnectivityState {
    match self.state.lock() {
      Ok(state) => state.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  pub fn status(&self) -> ConnectivityStatus {
    *self.status_tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.status() == ConnectivityStatus::Online
  }

  /// Receiver that observes every status change.
  pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
    self.status_tx.subscribe()
  }

  /// Register a callback run on every status change with `(old, new)`.
  pub fn on_transition(&self, callback: TransitionCallback) {
    if let Ok(mut callbacks) = self.callbacks.lock() {
      callbacks.push(callback);
    }
  }

  /// Probe once and apply the result.
  pub async fn check_now(&self) -> ConnectivityStatus {
    match self.probe.probe().await {
      Ok(()) => self.record_success(),
      Err(failure) => {
        debug!(error = %failure, "health check failed");
        self.record_failure(&failure)
      }
    }
  }

  pub fn record_success(&self) -> ConnectivityStatus {
    self.apply(|state, _| {
      state.consecutive_failures = 0;
      state.last_error = None;
      ConnectivityStatus::Online
    })
  }

  pub fn record_failure(&self, failure: &ProbeFailure) -> ConnectivityStatus {
    self.apply(|state, threshold| {
      state.consecutive_failures = state.consecutive_failures.saturating_add(1);
      state.last_error = Some(failure.to_string());
      if state.consecutive_failures < threshold {
        state.status
      } else if failure.is_timeout_class() {
        ConnectivityStatus::Offline
      } else {
        ConnectivityStatus::Degraded
      }
    })
  }

  fn apply(
    &self,
    update: impl FnOnce(&mut ConnectivityState, u32) -> ConnectivityStatus,
  ) -> ConnectivityStatus {
    let (old, new) = {
      let mut state = match self.state.lock() {
        Ok(state) => state,
        Err(poisoned) => poisoned.into_inner(),
      };
      state.last_check = Some(Utc::now());
      let old = state.status;
      let new = update(&mut state, self.failure_threshold);
      state.status = new;
      (old, new)
    };

    if old != new {
      info!(from = %old, to = %new, "connectivity changed");
      self.status_tx.send_replace(new);
      if let Ok(callbacks) = self.callbacks.lock() {
        for callback in callbacks.iter() {
          callback(old, new);
        }
      }
    }
    new
  }

  /// Start the background probe loop: one check immediately, then one per
  /// interval until [`stop`](Self::stop). Calling it again while running
  /// does nothing.
  pub fn start(self: &Arc<Self>) {
    let mut task = match self.task.lock() {
      Ok(task) => task,
      Err(poisoned) => poisoned.into_inner(),
    };
    if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
      return;
    }

    let monitor = Arc::clone(self);
    let stop = Arc::clone(&self.stop);
    *task = Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(monitor.interval);
      loop {
        tokio::select! {
          _ = stop.notified() => break,
          _ = ticker.tick() => {
            monitor.check_now().await;
          }
        }
      }
      debug!("connectivity monitor stopped");
    }));
    info!(interval_secs = self.interval.as_secs(), "connectivity monitor started");
  }

  /// Stop the probe loop and wait for it to exit.
  pub async fn stop(&self) {
    let handle = match self.task.lock() {
      Ok(mut task) => task.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(handle) = handle {
      self.stop.notify_one();
      if let Err(e) = handle.await {
        warn!(error = %e, "connectivity monitor task failed");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::VecDeque;

  /// Replays scripted probe results; answers success once exhausted.
  #[derive(Default)]
  struct ScriptedProbe {
    results: Mutex<VecDeque<Result<(), ProbeFailure>>>,
  }

  impl ScriptedProbe {
    fn with(results: Vec<Result<(), ProbeFailure>>) -> Arc<Self> {
      Arc::new(Self {
        results: Mutex::new(results.into()),
      })
    }
  }

  #[async_trait]
  impl HealthProbe for ScriptedProbe {
    async fn probe(&self) -> Result<(), ProbeFailure> {
      self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
  }

  fn monitor(probe: Arc<ScriptedProbe>) -> ConnectivityMonitor {
    ConnectivityMonitor::new(probe, &ConnectivityConfig::default())
  }

  #[tokio::test]
  async fn test_timeout_threshold_then_recovery() {
    let probe = ScriptedProbe::with(vec![
      Ok(()),
      Err(ProbeFailure::Timeout),
      Err(ProbeFailure::Timeout),
      Err(ProbeFailure::Timeout),
      Ok(()),
    ]);
    let monitor = monitor(probe);
    assert_eq!(monitor.status(), ConnectivityStatus::Offline);

    assert_eq!(monitor.check_now().await, ConnectivityStatus::Online);
    assert_eq!(monitor.check_now().await, ConnectivityStatus::Online);
    assert_eq!(monitor.check_now().await, ConnectivityStatus::Online);
    assert_eq!(monitor.state().consecutive_failures, 2);

    assert_eq!(monitor.check_now().await, ConnectivityStatus::Offline);
    assert_eq!(monitor.state().consecutive_failures, 3);
    assert!(monitor.state().last_error.is_some());

    assert_eq!(monitor.check_now().await, ConnectivityStatus::Online);
    let state = monitor.state();
    assert_eq!(state.consecutive_failures, 0);
    assert!(state.last_error.is_none());
    assert!(state.last_check.is_some());
  }

  #[tokio::test]
  async fn test_bad_status_holds_then_degrades() {
    let monitor = monitor(ScriptedProbe::with(vec![]));
    monitor.record_success();

    let bad = ProbeFailure::BadStatus(503);
    assert_eq!(monitor.record_failure(&bad), ConnectivityStatus::Online);
    assert_eq!(monitor.record_failure(&bad), ConnectivityStatus::Online);
    assert_eq!(monitor.record_failure(&bad), ConnectivityStatus::Degraded);
  }

  #[tokio::test]
  async fn test_transition_callbacks_and_watch() {
    let monitor = monitor(ScriptedProbe::with(vec![]));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    monitor.on_transition(Box::new(move |old, new| {
      sink.lock().unwrap().push((old, new));
    }));
    let mut rx = monitor.subscribe();

    monitor.record_success();
    monitor.record_success();
    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), ConnectivityStatus::Online);
    assert_eq!(
      *seen.lock().unwrap(),
      vec![(ConnectivityStatus::Offline, ConnectivityStatus::Online)]
    );
  }

  #[tokio::test]
  async fn test_start_probes_immediately_and_stops() {
    let monitor = Arc::new(monitor(ScriptedProbe::with(vec![Ok(())])));
    let mut rx = monitor.subscribe();
    monitor.start();
    tokio::time::timeout(Duration::from_secs(2), rx.changed())
      .await
      .unwrap()
      .unwrap();
    assert!(monitor.is_online());
    monitor.stop().await;
  }
}
