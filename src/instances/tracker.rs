//! Pending change bookkeeping across all instances: summaries, replay and
//! conflict resolution.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::store::InstanceStore;
use super::syncer::InstanceSync;
use super::types::{
  instance_key, ConflictInfo, ConflictResolution, InstanceMetadata, LocalChange, SyncStatus,
};
use crate::remote::api_types::SyncDirection;

/// Unsynced local changes across every instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
  /// Unsynced change log entries
  pub total_pending: usize,
  /// Instances with at least one unsynced entry
  pub instances_with_changes: usize,
  /// Unsynced entries per instance type
  pub by_type: BTreeMap<String, usize>,
  /// `created_at` of the oldest unsynced entry
  pub oldest_pending: Option<DateTime<Utc>>,
}

/// What a replay did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
  /// Pushes sent
  pub attempted: usize,
  /// Changes now marked synced, including ones an earlier push reconciled
  pub synced: usize,
  /// Pushes that hit a conflict; replay of that instance stops there
  pub conflicts: usize,
  /// Pushes that failed; replay of that instance stops there
  pub failed: usize,
}

impl ReplayStats {
  fn add(&mut self, other: ReplayStats) {
    self.attempted += other.attempted;
    self.synced += other.synced;
    self.conflicts += other.conflicts;
    self.failed += other.failed;
  }
}

pub struct ChangeTracker {
  store: Arc<InstanceStore>,
  syncer: Arc<dyn InstanceSync>,
}

impl ChangeTracker {
  pub fn new(store: Arc<InstanceStore>, syncer: Arc<dyn InstanceSync>) -> Self {
    Self { store, syncer }
  }

  /// Every unsynced change of every instance, grouped per instance and
  /// oldest first within each.
  pub fn get_pending_changes(&self) -> Result<Vec<LocalChange>> {
    let mut out = Vec::new();
    for meta in self.store.list_instances(None)? {
      out.extend(
        self
          .store
          .get_pending_changes(&meta.instance_type, &meta.instance_id)?,
      );
    }
    Ok(out)
  }

  pub fn get_change_summary(&self) -> Result<ChangeSummary> {
    let mut summary = ChangeSummary::default();
    for meta in self.store.list_instances(None)? {
      let pending = self
        .store
        .get_pending_changes(&meta.instance_type, &meta.instance_id)?;
      if pending.is_empty() {
        continue;
      }
      summary.instances_with_changes += 1;
      summary.total_pending += pending.len();
      *summary.by_type.entry(meta.instance_type.clone()).or_default() += pending.len();
      let oldest = pending.iter().map(|c| c.created_at).min();
      summary.oldest_pending = match (summary.oldest_pending, oldest) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
      };
    }
    Ok(summary)
  }

  /// Push one instance's pending changes in order.
  ///
  /// A change is marked synced only when its push comes back SYNCED or
  /// MERGED. Replay stops at the first conflict or failure so later changes
  /// are never sent ahead of an earlier one. Nothing is deleted.
  pub async fn replay_changes(&self, instance_type: &str, instance_id: &str) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    let key = instance_key(instance_type, instance_id);

    for change in self.store.get_pending_changes(instance_type, instance_id)? {
      // A successful push reconciles the whole log, so re-check.
      let still_pending = self
        .store
        .get_pending_changes(instance_type, instance_id)?
        .iter()
        .any(|c| c.change_id == change.change_id);
      if !still_pending {
        stats.synced += 1;
        continue;
      }

      stats.attempted += 1;
      let outcome = self
        .syncer
        .sync_instance(instance_type, instance_id, SyncDirection::Push, None)
        .await;
      match outcome.status {
        SyncStatus::Synced | SyncStatus::Merged => {
          self
            .store
            .mark_change_synced(instance_type, instance_id, &change.change_id)?;
          stats.synced += 1;
        }
        SyncStatus::Conflict => {
          warn!(instance = %key, change_id = %change.change_id, "replay hit a conflict");
          stats.conflicts += 1;
          break;
        }
        SyncStatus::Failed => {
          warn!(
            instance = %key,
            change_id = %change.change_id,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "replay failed"
          );
          stats.failed += 1;
          break;
        }
      }
    }

    if stats.attempted > 0 {
      info!(
        instance = %key,
        synced = stats.synced,
        conflicts = stats.conflicts,
        failed = stats.failed,
        "replayed local changes"
      );
    }
    Ok(stats)
  }

  pub async fn replay_all_changes(&self) -> Result<ReplayStats> {
    let mut total = ReplayStats::default();
    for meta in self.store.list_instances(None)? {
      if self
        .store
        .get_pending_changes(&meta.instance_type, &meta.instance_id)?
        .is_empty()
      {
        continue;
      }
      total.add(
        self
          .replay_changes(&meta.instance_type, &meta.instance_id)
          .await?,
      );
    }
    Ok(total)
  }

  /// Conflict payload for an instance whose versions disagree.
  pub fn get_conflict_info(
    &self,
    instance_type: &str,
    instance_id: &str,
  ) -> Result<Option<ConflictInfo>> {
    let Some(instance) = self.store.get_instance(instance_type, instance_id)? else {
      return Ok(None);
    };
    let meta = instance.metadata;
    if meta.local_version == meta.cloud_version {
      return Ok(None);
    }
    let pending_changes = self
      .store
      .get_pending_changes(instance_type, instance_id)?
      .len();
    Ok(Some(ConflictInfo {
      instance_id: meta.instance_id,
      instance_type: meta.instance_type,
      local_version: meta.local_version,
      cloud_version: meta.cloud_version,
      local_data: Some(instance.data),
      pending_changes,
      resolution_options: ConflictResolution::OPTIONS
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }))
  }

  /// Settle a conflict against stored metadata without contacting the
  /// remote.
  ///
  /// - `UseCloud`: local version drops to the cloud version and pending
  ///   changes are marked synced. The next pull brings the content.
  /// - `UseLocal`: cloud version is raised to the local version; changes stay
  ///   pending for the next push.
  /// - `ManualMerge`: merged content is written and both versions move past
  ///   the higher of the two.
  pub fn resolve_conflict(
    &self,
    instance_type: &str,
    instance_id: &str,
    resolution: ConflictResolution,
  ) -> Result<InstanceMetadata> {
    let Some(mut meta) = self.store.get_metadata(instance_type, instance_id)? else {
      return Err(eyre!(
        "Instance {}/{} does not exist",
        instance_type,
        instance_id
      ));
    };

    match &resolution {
      ConflictResolution::UseCloud => {
        meta.local_version = meta.cloud_version;
        meta.has_local_changes = false;
        self.store.save_metadata(&meta)?;
        self.store.mark_all_changes_synced(instance_type, instance_id)?;
      }
      ConflictResolution::UseLocal => {
        meta.cloud_version = meta.local_version;
        self.store.save_metadata(&meta)?;
      }
      ConflictResolution::ManualMerge(merged) => {
        let version = meta.local_version.max(meta.cloud_version) + 1;
        self
          .store
          .update_instance(instance_type, instance_id, merged, false)?;
        meta = self
          .store
          .get_metadata(instance_type, instance_id)?
          .ok_or_else(|| eyre!("Instance {}/{} vanished", instance_type, instance_id))?;
        meta.local_version = version;
        meta.cloud_version = version;
        meta.has_local_changes = false;
        meta.updated_at = Utc::now();
        self.store.save_metadata(&meta)?;
        self.store.mark_all_changes_synced(instance_type, instance_id)?;
      }
    }

    info!(
      instance = %meta.key(),
      resolution = resolution.as_str(),
      local_version = meta.local_version,
      cloud_version = meta.cloud_version,
      "resolved conflict"
    );
    Ok(meta)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::instances::types::SyncOutcome;
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tempfile::TempDir;

  /// Answers every call with a fixed status and touches nothing.
  struct StubSync {
    status: SyncStatus,
    calls: AtomicUsize,
  }

  impl StubSync {
    fn new(status: SyncStatus) -> Arc<Self> {
      Arc::new(Self {
        status,
        calls: AtomicUsize::new(0),
      })
    }
  }

  #[async_trait]
  impl InstanceSync for StubSync {
    async fn sync_instance(
      &self,
      _instance_type: &str,
      _instance_id: &str,
      _direction: SyncDirection,
      _resolution: Option<ConflictResolution>,
    ) -> SyncOutcome {
      self.calls.fetch_add(1, Ordering::SeqCst);
      match self.status {
        SyncStatus::Failed => SyncOutcome::failed("remote down"),
        SyncStatus::Conflict => SyncOutcome::conflict(Some(9), json!({})),
        _ => SyncOutcome::synced(Some(1)),
      }
    }
  }

  fn setup(status: SyncStatus) -> (TempDir, Arc<InstanceStore>, Arc<StubSync>, ChangeTracker) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InstanceStore::open(dir.path()).unwrap());
    let stub = StubSync::new(status);
    let tracker = ChangeTracker::new(Arc::clone(&store), stub.clone());
    (dir, store, stub, tracker)
  }

  fn with_changes(store: &InstanceStore, id: &str, count: u64) {
    store.create_instance("ticket", id, &json!({"n": 0})).unwrap();
    for n in 1..=count {
      store.update_instance("ticket", id, &json!({"n": n}), true).unwrap();
    }
  }

  #[tokio::test]
  async fn test_replay_marks_every_change_synced() {
    let (_dir, store, stub, tracker) = setup(SyncStatus::Synced);
    with_changes(&store, "t-1", 3);

    let stats = tracker.replay_changes("ticket", "t-1").await.unwrap();
    assert_eq!(stats.attempted, 3);
    assert_eq!(stats.synced, 3);
    assert_eq!(stub.calls.load(Ordering::SeqCst), 3);

    let changes = store.get_local_changes("ticket", "t-1").unwrap();
    assert_eq!(changes.len(), 3);
    assert!(changes.iter().all(|c| c.synced));
    assert!(store.get_pending_changes("ticket", "t-1").unwrap().is_empty());
    assert!(tracker.get_pending_changes().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_replay_stops_at_failure_and_keeps_entries() {
    let (_dir, store, stub, tracker) = setup(SyncStatus::Failed);
    with_changes(&store, "t-1", 2);

    let stats = tracker.replay_changes("ticket", "t-1").await.unwrap();
    assert_eq!((stats.attempted, stats.synced, stats.failed), (1, 0, 1));
    assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_pending_changes("ticket", "t-1").unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_replay_all_counts_conflicts() {
    let (_dir, store, _stub, tracker) = setup(SyncStatus::Conflict);
    with_changes(&store, "t-1", 1);
    with_changes(&store, "t-2", 2);
    store.record_sync("ticket", "t-3", 1, Some(&json!({}))).unwrap();

    let stats = tracker.replay_all_changes().await.unwrap();
    assert_eq!(stats.conflicts, 2);
    assert_eq!(stats.synced, 0);
  }

  #[test]
  fn test_change_summary() {
    let (_dir, store, _stub, tracker) = setup(SyncStatus::Synced);
    with_changes(&store, "t-1", 2);
    with_changes(&store, "t-2", 1);
    store.create_instance("note", "n-1", &json!({})).unwrap();

    let summary = tracker.get_change_summary().unwrap();
    assert_eq!(summary.total_pending, 3);
    assert_eq!(summary.instances_with_changes, 2);
    assert_eq!(summary.by_type.get("ticket"), Some(&3));
    assert!(summary.by_type.get("note").is_none());
    assert!(summary.oldest_pending.is_some());
  }

  fn diverged(store: &InstanceStore) {
    with_changes(store, "t-1", 2);
    store.set_cloud_version("ticket", "t-1", 1).unwrap();
    let meta = store.get_metadata("ticket", "t-1").unwrap().unwrap();
    assert_eq!((meta.local_version, meta.cloud_version), (3, 1));
  }

  #[test]
  fn test_conflict_info_only_when_versions_differ() {
    let (_dir, store, _stub, tracker) = setup(SyncStatus::Synced);
    diverged(&store);
    let info = tracker.get_conflict_info("ticket", "t-1").unwrap().unwrap();
    assert_eq!(info.pending_changes, 2);
    assert_eq!(info.local_data, Some(json!({"n": 2})));
    assert_eq!(info.resolution_options, vec!["use_local", "use_cloud", "manual_merge"]);

    store.record_sync("ticket", "t-2", 4, Some(&json!({}))).unwrap();
    assert!(tracker.get_conflict_info("ticket", "t-2").unwrap().is_none());
    assert!(tracker.get_conflict_info("ticket", "missing").unwrap().is_none());
  }

  #[test]
  fn test_use_cloud_is_idempotent() {
    let (_dir, store, _stub, tracker) = setup(SyncStatus::Synced);
    diverged(&store);

    let first = tracker
      .resolve_conflict("ticket", "t-1", ConflictResolution::UseCloud)
      .unwrap();
    assert_eq!(first.local_version, 1);
    assert!(!first.has_local_changes);
    assert!(store.get_pending_changes("ticket", "t-1").unwrap().is_empty());

    let second = tracker
      .resolve_conflict("ticket", "t-1", ConflictResolution::UseCloud)
      .unwrap();
    assert_eq!(first, second);
  }

  #[test]
  fn test_use_local_and_manual_merge() {
    let (_dir, store, _stub, tracker) = setup(SyncStatus::Synced);
    diverged(&store);

    let local = tracker
      .resolve_conflict("ticket", "t-1", ConflictResolution::UseLocal)
      .unwrap();
    assert_eq!((local.local_version, local.cloud_version), (3, 3));
    assert_eq!(store.get_pending_changes("ticket", "t-1").unwrap().len(), 2);

    store.set_cloud_version("ticket", "t-1", 5).unwrap();
    let merged = tracker
      .resolve_conflict(
        "ticket",
        "t-1",
        ConflictResolution::ManualMerge(json!({"n": "merged"})),
      )
      .unwrap();
    assert_eq!((merged.local_version, merged.cloud_version), (6, 6));
    assert!(merged.in_sync());
    assert_eq!(
      store.get_instance("ticket", "t-1").unwrap().unwrap().data,
      json!({"n": "merged"})
    );
    assert!(store.get_pending_changes("ticket", "t-1").unwrap().is_empty());
    assert!(tracker
      .resolve_conflict("ticket", "missing", ConflictResolution::UseCloud)
      .is_err());
  }
}
