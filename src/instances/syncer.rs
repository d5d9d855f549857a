//! Pull, push and merge of instances against the remote.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::json;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use super::store::InstanceStore;
use super::types::{instance_key, ConflictResolution, Instance, SyncOutcome};
use crate::connectivity::offline::{DeferredTask, OfflineManager};
use crate::error::SyncError;
use crate::lock::KeyedLocks;
use crate::remote::api_types::{
  InstanceRef, InstanceSyncRequest, InstanceSyncResult, RemoteSyncStatus, SyncDirection,
};
use crate::remote::SyncApi;

/// Anything that can sync one instance. The change tracker drives replay
/// through this.
#[async_trait]
pub trait InstanceSync: Send + Sync {
  async fn sync_instance(
    &self,
    instance_type: &str,
    instance_id: &str,
    direction: SyncDirection,
    resolution: Option<ConflictResolution>,
  ) -> SyncOutcome;
}

enum StepError {
  Remote(SyncError),
  Local(color_eyre::Report),
}

impl From<SyncError> for StepError {
  fn from(e: SyncError) -> Self {
    Self::Remote(e)
  }
}

impl From<color_eyre::Report> for StepError {
  fn from(e: color_eyre::Report) -> Self {
    Self::Local(e)
  }
}

type StepResult = Result<SyncOutcome, StepError>;

/// Syncs instances held in an [`InstanceStore`].
///
/// Calls for the same instance are serialized in-process. When an
/// [`OfflineManager`] is attached, a call that fails on the network is queued
/// and replayed on reconnect.
pub struct InstanceSyncer {
  store: Arc<InstanceStore>,
  api: Arc<dyn SyncApi>,
  offline: Option<Arc<OfflineManager>>,
  locks: KeyedLocks,
  this: Weak<InstanceSyncer>,
}

impl InstanceSyncer {
  pub fn new(
    store: Arc<InstanceStore>,
    api: Arc<dyn SyncApi>,
    offline: Option<Arc<OfflineManager>>,
  ) -> Arc<Self> {
    Arc::new_cyclic(|this| Self {
      store,
      api,
      offline,
      locks: KeyedLocks::new(),
      this: this.clone(),
    })
  }

  pub fn store(&self) -> &Arc<InstanceStore> {
    &self.store
  }

  async fn run(
    &self,
    instance_type: &str,
    instance_id: &str,
    direction: SyncDirection,
    resolution: Option<ConflictResolution>,
  ) -> SyncOutcome {
    let key = instance_key(instance_type, instance_id);
    let _guard = self.locks.lock(&key).await;
    debug!(instance = %key, %direction, "syncing instance");

    let result = match direction {
      SyncDirection::Pull => self.pull(instance_type, instance_id, false).await,
      SyncDirection::Push => self.push(instance_type, instance_id).await,
      SyncDirection::Merge => self.merge(instance_type, instance_id, resolution.clone()).await,
    };

    match result {
      Ok(outcome) => {
        info!(instance = %key, %direction, status = %outcome.status, "instance sync finished");
        outcome
      }
      Err(StepError::Remote(e)) if e.is_network() => {
        warn!(instance = %key, %direction, error = %e, "instance sync failed on the network");
        let queued = self
          .requeue(instance_type, instance_id, direction, resolution)
          .await;
        SyncOutcome {
          queued,
          ..SyncOutcome::failed(e.to_string())
        }
      }
      Err(StepError::Remote(e)) if e.is_auth() => {
        error!(instance = %key, %direction, error = %e, "remote rejected credentials");
        SyncOutcome::failed(e.to_string())
      }
      Err(StepError::Remote(e)) => {
        warn!(instance = %key, %direction, error = %e, "instance sync rejected");
        SyncOutcome::failed(e.to_string())
      }
      Err(StepError::Local(e)) => {
        warn!(instance = %key, %direction, error = %e, "instance sync failed locally");
        SyncOutcome::failed(e.to_string())
      }
    }
  }

  /// Boxed so the deferred task can hold the sync future without a
  /// recursive opaque type.
  fn run_boxed(
    self: Arc<Self>,
    instance_type: String,
    instance_id: String,
    direction: SyncDirection,
    resolution: Option<ConflictResolution>,
  ) -> BoxFuture<'static, SyncOutcome> {
    async move {
      self
        .run(&instance_type, &instance_id, direction, resolution)
        .await
    }
    .boxed()
  }

  async fn requeue(
    &self,
    instance_type: &str,
    instance_id: &str,
    direction: SyncDirection,
    resolution: Option<ConflictResolution>,
  ) -> bool {
    let (Some(offline), Some(this)) = (self.offline.as_ref(), self.this.upgrade()) else {
      return false;
    };
    let instance_type = instance_type.to_string();
    let instance_id = instance_id.to_string();
    let name = format!("{} {}", direction, instance_key(&instance_type, &instance_id));
    offline
      .defer(DeferredTask::new(name, move || {
        async move {
          let outcome = this
            .run_boxed(instance_type, instance_id, direction, resolution)
            .await;
          match outcome.error {
            Some(error) if !outcome.status.is_success() => {
              Err(color_eyre::eyre::eyre!("{}", error))
            }
            _ => Ok(()),
          }
        }
        .boxed()
      }))
      .await;
    true
  }

  async fn call(
    &self,
    direction: SyncDirection,
    instance: InstanceRef,
  ) -> Result<InstanceSyncResult, SyncError> {
    let request = InstanceSyncRequest {
      direction,
      instances: vec![instance],
    };
    let response = self.api.sync_instances(&request).await?;
    response
      .results
      .into_iter()
      .next()
      .ok_or_else(|| SyncError::InvalidResponse("sync response has no results".into()))
  }

  /// Send the local version; apply cloud content when it is newer, or
  /// always when `force_apply` (resolving a conflict in the cloud's favor).
  async fn pull(&self, instance_type: &str, instance_id: &str, force_apply: bool) -> StepResult {
    let local = self.store.get_instance(instance_type, instance_id)?;
    let local_version = local.as_ref().map(|i| i.metadata.local_version).unwrap_or(0);

    let result = self
      .call(
        SyncDirection::Pull,
        InstanceRef {
          id: instance_id.to_string(),
          instance_type: instance_type.to_string(),
          local_data: None,
          local_version: Some(local_version),
        },
      )
      .await?;

    match result.status {
      RemoteSyncStatus::Synced | RemoteSyncStatus::Merged => {
        let cloud_version = result.cloud_version;
        match (cloud_version, result.cloud_data.as_ref()) {
          (Some(cv), Some(data)) if force_apply || cv > local_version => {
            self.store.record_sync(instance_type, instance_id, cv, Some(data))?;
            info!(
              instance = %instance_key(instance_type, instance_id),
              from = local_version,
              to = cv,
              "applied cloud content"
            );
          }
          _ => {
            self
              .store
              .touch_last_sync(instance_type, instance_id, chrono::Utc::now())?;
          }
        }
        Ok(SyncOutcome::synced(cloud_version))
      }
      RemoteSyncStatus::Conflict => Ok(self.conflict(instance_type, instance_id, local.as_ref(), &result)?),
      RemoteSyncStatus::Failed => Ok(remote_failure(&result)),
    }
  }

  /// Send local content and version. On success both versions become the
  /// returned cloud version and pending changes are marked synced.
  async fn push(&self, instance_type: &str, instance_id: &str) -> StepResult {
    let Some(local) = self.store.get_instance(instance_type, instance_id)? else {
      return Ok(SyncOutcome::failed(format!(
        "instance {} does not exist",
        instance_key(instance_type, instance_id)
      )));
    };

    let result = self
      .call(
        SyncDirection::Push,
        InstanceRef {
          id: instance_id.to_string(),
          instance_type: instance_type.to_string(),
          local_data: Some(local.data.clone()),
          local_version: Some(local.metadata.local_version),
        },
      )
      .await?;

    match result.status {
      RemoteSyncStatus::Synced | RemoteSyncStatus::Merged => {
        let cloud_version = result.cloud_version.unwrap_or(local.metadata.local_version);
        self
          .store
          .record_sync(instance_type, instance_id, cloud_version, None)?;
        Ok(SyncOutcome::synced(Some(cloud_version)))
      }
      RemoteSyncStatus::Conflict => Ok(self.conflict(instance_type, instance_id, Some(&local), &result)?),
      RemoteSyncStatus::Failed => Ok(remote_failure(&result)),
    }
  }

  async fn merge(
    &self,
    instance_type: &str,
    instance_id: &str,
    resolution: Option<ConflictResolution>,
  ) -> StepResult {
    let local = self.store.get_instance(instance_type, instance_id)?;
    if let Some(local) = local.as_ref() {
      if local.metadata.in_sync() {
        return Ok(
          SyncOutcome::synced(Some(local.metadata.cloud_version)).with_message("already in sync"),
        );
      }
    }

    let result = self
      .call(
        SyncDirection::Merge,
        InstanceRef {
          id: instance_id.to_string(),
          instance_type: instance_type.to_string(),
          local_data: local.as_ref().map(|i| i.data.clone()),
          local_version: local.as_ref().map(|i| i.metadata.local_version),
        },
      )
      .await?;

    match result.status {
      RemoteSyncStatus::Synced | RemoteSyncStatus::Merged => {
        let fallback = local.as_ref().map(|i| i.metadata.local_version).unwrap_or(0);
        let cloud_version = result.cloud_version.unwrap_or(fallback);
        self.store.record_sync(
          instance_type,
          instance_id,
          cloud_version,
          result.cloud_data.as_ref(),
        )?;
        Ok(if result.status == RemoteSyncStatus::Merged {
          SyncOutcome::merged(Some(cloud_version))
        } else {
          SyncOutcome::synced(Some(cloud_version))
        })
      }
      RemoteSyncStatus::Conflict => match resolution {
        Some(ConflictResolution::UseLocal) => {
          info!(instance = %instance_key(instance_type, instance_id), "conflict: keeping local");
          self.push(instance_type, instance_id).await
        }
        Some(ConflictResolution::UseCloud) => {
          info!(instance = %instance_key(instance_type, instance_id), "conflict: taking cloud");
          self.pull(instance_type, instance_id, true).await
        }
        _ => Ok(self.conflict(instance_type, instance_id, local.as_ref(), &result)?),
      },
      RemoteSyncStatus::Failed => Ok(remote_failure(&result)),
    }
  }

  /// Record the remote version and build the conflict outcome.
  fn conflict(
    &self,
    instance_type: &str,
    instance_id: &str,
    local: Option<&Instance>,
    result: &InstanceSyncResult,
  ) -> color_eyre::Result<SyncOutcome> {
    if let Some(cv) = result.cloud_version {
      self.store.set_cloud_version(instance_type, instance_id, cv)?;
    }
    warn!(
      instance = %instance_key(instance_type, instance_id),
      local_version = local.map(|i| i.metadata.local_version),
      cloud_version = result.cloud_version,
      "sync conflict"
    );
    let payload = json!({
      "local_version": local.map(|i| i.metadata.local_version),
      "cloud_version": result.cloud_version,
      "cloud_data": result.cloud_data,
      "details": result.conflict,
      "resolution_options": ConflictResolution::OPTIONS,
    });
    Ok(SyncOutcome::conflict(result.cloud_version, payload))
  }
}

fn remote_failure(result: &InstanceSyncResult) -> SyncOutcome {
  SyncOutcome::failed(
    result
      .error
      .clone()
      .unwrap_or_else(|| "remote reported failure".to_string()),
  )
}

#[async_trait]
impl InstanceSync for InstanceSyncer {
  async fn sync_instance(
    &self,
    instance_type: &str,
    instance_id: &str,
    direction: SyncDirection,
    resolution: Option<ConflictResolution>,
  ) -> SyncOutcome {
    self
      .run(instance_type, instance_id, direction, resolution)
      .await
  }
}
