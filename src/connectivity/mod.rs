//! Remote reachability tracking and offline-mode task deferral.

pub mod monitor;
pub mod offline;

pub use monitor::{
  ConnectivityMonitor, ConnectivityState, ConnectivityStatus, HealthProbe, HttpHealthProbe,
  ProbeFailure,
};
pub use offline::{DeferredTask, OfflineManager, Operation, TaskDisposition};
