//! Editable instances: local storage with change tracking, sync against the
//! remote and conflict handling.

pub mod store;
pub mod syncer;
pub mod tracker;
pub mod types;

pub use store::InstanceStore;
pub use syncer::{InstanceSync, InstanceSyncer};
pub use tracker::{ChangeSummary, ChangeTracker, ReplayStats};
pub use types::{
  ConflictInfo, ConflictResolution, Instance, InstanceMetadata, LocalChange, SyncOutcome,
  SyncStatus,
};
