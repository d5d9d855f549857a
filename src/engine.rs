//! Wires every component into one engine: asset cache, instance store,
//! syncer, change tracker, connectivity monitor and offline manager.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::assets::AssetFetcher;
use crate::cache::storage::checksum_matches;
use crate::cache::{AssetCache, CacheStats, CacheStore, CleanupStats};
use crate::config::Config;
use crate::connectivity::{
  ConnectivityMonitor, ConnectivityState, HealthProbe, HttpHealthProbe, OfflineManager,
};
use crate::instances::{
  ChangeSummary, ChangeTracker, ConflictResolution, InstanceStore, InstanceSync, InstanceSyncer,
  SyncOutcome,
};
use crate::remote::api_types::{
  AssetVersionRef, SyncDirection, VersionCheckRequest, VersionCheckResponse,
};
use crate::remote::{SyncApi, SyncClient};
use crate::uri::{AssetUri, UriError};

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
  pub connectivity: ConnectivityState,
  pub remote_configured: bool,
  pub device_id: Option<String>,
  pub last_sync: Option<DateTime<Utc>>,
  pub cache: CacheStats,
  pub pending_changes: ChangeSummary,
  pub queued_tasks: usize,
}

pub struct SyncEngine {
  config: Config,
  api: Arc<dyn SyncApi>,
  remote_configured: bool,
  cache: AssetCache,
  instances: Arc<InstanceStore>,
  monitor: Arc<ConnectivityMonitor>,
  offline: Arc<OfflineManager>,
  syncer: Arc<InstanceSyncer>,
  tracker: ChangeTracker,
}

impl SyncEngine {
  /// Open against the HTTP remote described by `config`. Must run inside a
  /// Tokio runtime. Does not start the connectivity probe loop; call
  /// [`start`](Self::start) for that.
  pub fn open(config: Config) -> Result<Self> {
    let client = SyncClient::new(&config.remote, Config::get_api_key())?;
    if !client.is_configured() {
      warn!("remote sync is not configured, running offline only");
    }
    let probe = Arc::new(HttpHealthProbe::new(client.clone(), &config.connectivity));
    let configured = client.is_configured();
    let mut engine = Self::open_with(config, Arc::new(client), probe)?;
    engine.remote_configured = configured;
    Ok(engine)
  }

  /// Open against any remote and health probe.
  pub fn open_with(
    config: Config,
    api: Arc<dyn SyncApi>,
    probe: Arc<dyn HealthProbe>,
  ) -> Result<Self> {
    let cache_root = config.cache_root()?;
    let store = Arc::new(CacheStore::open(&cache_root)?);
    if let Some(device_id) = &config.device_id {
      store.set_device_id(device_id)?;
    }
    let monitor = Arc::new(ConnectivityMonitor::new(probe, &config.connectivity));
    let offline = OfflineManager::new(&monitor);
    offline.attach();

    let cache = AssetCache::new(AssetFetcher::new(store, Arc::clone(&api)), &config.refresh)
      .with_offline(Arc::clone(&offline));
    let instances = Arc::new(InstanceStore::open(config.instances_root()?)?);

    let syncer = InstanceSyncer::new(
      Arc::clone(&instances),
      Arc::clone(&api),
      Some(Arc::clone(&offline)),
    );
    let tracker = ChangeTracker::new(Arc::clone(&instances), syncer.clone());

    info!(cache = %cache_root.display(), instances = %instances.root().display(), "sync engine opened");
    Ok(Self {
      config,
      api,
      remote_configured: true,
      cache,
      instances,
      monitor,
      offline,
      syncer,
      tracker,
    })
  }

  /// Start background connectivity probing.
  pub fn start(&self) {
    self.monitor.start();
  }

  pub fn cache(&self) -> &AssetCache {
    &self.cache
  }

  pub fn instances(&self) -> &Arc<InstanceStore> {
    &self.instances
  }

  pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
    &self.monitor
  }

  pub fn offline(&self) -> &Arc<OfflineManager> {
    &self.offline
  }

  pub fn tracker(&self) -> &ChangeTracker {
    &self.tracker
  }

  /// Asset bytes, cache-first. Offline, only the cache is read. `None` when
  /// neither the remote nor the cache can supply them.
  pub async fn fetch(&self, uri: &str) -> Result<Option<Vec<u8>>, UriError> {
    Ok(self.cache.fetch(uri, false).await?.map(|r| r.data))
  }

  /// Cached asset bytes without touching the network.
  pub fn get_cached(&self, uri: &str) -> Result<Option<Vec<u8>>, UriError> {
    Ok(self.cache.get_cached(uri)?.map(|r| r.data))
  }

  pub async fn sync_instance(
    &self,
    instance_type: &str,
    instance_id: &str,
    direction: SyncDirection,
  ) -> SyncOutcome {
    self
      .syncer
      .sync_instance(instance_type, instance_id, direction, None)
      .await
  }

  /// Like [`sync_instance`](Self::sync_instance) with a conflict hint for
  /// merges.
  pub async fn sync_instance_with(
    &self,
    instance_type: &str,
    instance_id: &str,
    direction: SyncDirection,
    resolution: ConflictResolution,
  ) -> SyncOutcome {
    self
      .syncer
      .sync_instance(instance_type, instance_id, direction, Some(resolution))
      .await
  }

  /// Report cached asset checksums to the remote and record what it answers:
  /// last sync time, license and device id go into the manifest. Cached
  /// assets whose remote checksum differs are queued for background refresh.
  pub async fn check_versions(&self) -> Result<VersionCheckResponse> {
    let store = self.cache.store();
    let manifest = store.manifest()?;
    let request = VersionCheckRequest {
      client_version: self.config.remote.client_version.clone(),
      capabilities: self.config.remote.capabilities.clone(),
      assets: manifest
        .assets
        .iter()
        .map(|(uri, entry)| AssetVersionRef {
          uri: uri.clone(),
          checksum: Some(entry.checksum.clone()),
        })
        .collect(),
      license_id: self.config.license_id.clone(),
      device_id: manifest.device_id.clone(),
    };

    let response = self
      .api
      .check_versions(&request)
      .await
      .map_err(|e| eyre!("Failed to check versions: {}", e))?;

    store.set_last_sync(response.server_time.unwrap_or_else(Utc::now))?;
    if response.license.is_some() {
      store.set_license(response.license.clone())?;
    }
    if manifest.device_id.is_none() {
      if let Some(device_id) = &self.config.device_id {
        store.set_device_id(device_id)?;
      }
    }

    let mut scheduled = 0;
    for update in &response.asset_updates {
      let uri = match AssetUri::parse(&update.uri) {
        Ok(uri) => uri,
        Err(e) => {
          warn!(uri = %update.uri, error = %e, "ignoring update for malformed uri");
          continue;
        }
      };
      let Some(entry) = manifest.assets.get(&uri.to_string()) else {
        continue;
      };
      let changed = match &update.checksum {
        Some(remote) => !checksum_matches(remote, &entry.checksum),
        None => true,
      };
      if changed && self.cache.schedule_refresh(&uri).await {
        scheduled += 1;
      }
    }

    info!(
      assets = request.assets.len(),
      updates = response.asset_updates.len(),
      scheduled,
      client_update = response.client_update.is_some(),
      "version check finished"
    );
    Ok(response)
  }

  pub async fn status(&self) -> Result<EngineStatus> {
    let manifest = self.cache.store().manifest()?;
    Ok(EngineStatus {
      connectivity: self.monitor.state(),
      remote_configured: self.remote_configured,
      device_id: manifest.device_id,
      last_sync: manifest.last_sync,
      cache: self.cache.store().stats()?,
      pending_changes: self.tracker.get_change_summary()?,
      queued_tasks: self.offline.pending_count().await,
    })
  }

  /// Run deferred sync work now if the remote is reachable. Work deferred
  /// while the monitor already reported ONLINE sees no transition, so it
  /// waits for this. Returns how many tasks ran.
  pub async fn replay_deferred(&self) -> usize {
    if self.offline.is_offline() {
      return 0;
    }
    self.offline.drain_pending().await
  }

  /// Sweep expired assets out of the cache.
  pub fn cleanup(&self) -> Result<CleanupStats> {
    self.cache.lifecycle().cleanup_expired()
  }

  /// Stop probing, let background refreshes finish and stop following
  /// connectivity. Deferred tasks run one last time when the remote is
  /// reachable; anything still queued after that is dropped.
  pub async fn close(&self) {
    self.monitor.stop().await;
    self.offline.detach();
    self.replay_deferred().await;
    self.cache.close().await;
    let queued = self.offline.pending_count().await;
    if queued > 0 {
      warn!(queued, "closing with deferred tasks still queued");
    }
    debug!("sync engine closed");
  }
}
