//! Cache-first facade over the fetcher, the typed readers and the refresh pool.

use chrono::Utc;
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::lifecycle::LifecycleManager;
use super::refresh::RefreshPool;
use super::storage::CacheStore;
use super::types::{CacheLifecycle, CacheResult};
use crate::assets::fetcher::AssetFetcher;
use crate::assets::readers::{
  AssetFormat, AssetReader, FlowReader, LoadedAsset, Playbook, PlaybookReader, SchemaReader,
};
use crate::config::RefreshConfig;
use crate::connectivity::{DeferredTask, OfflineManager, Operation};
use crate::uri::{AssetUri, UriError};

/// What `check_and_update_assets` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
  /// URIs looked at
  pub checked: usize,
  /// URIs found EXPIRED
  pub expired: usize,
  /// Refreshed synchronously and now on disk
  pub refreshed: usize,
  /// Handed to the background pool, or deferred until reconnect
  pub scheduled: usize,
  /// Refresh failed or could not be queued
  pub failed: usize,
}

/// How a read proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPlan {
  /// Serve what is on disk without asking the remote, then queue a refresh
  /// when `refresh` is set.
  Cached { refresh: bool },
  /// Fetch from the remote first, falling back to the cached copy.
  Remote,
}

/// Entry point for reading assets.
///
/// Reads go cache-first. A STALE hit is served and a background refresh is
/// queued; EXPIRED and missing assets are fetched first. While the attached
/// [`OfflineManager`] reports OFFLINE nothing reaches the remote: reads are
/// served from disk and refreshes wait for the reconnect.
pub struct AssetCache {
  fetcher: AssetFetcher,
  flows: FlowReader,
  playbooks: PlaybookReader,
  schemas: SchemaReader,
  refresh: RefreshPool,
  offline: Option<Arc<OfflineManager>>,
}

impl AssetCache {
  /// Must be called inside a Tokio runtime (the refresh workers are spawned
  /// here).
  pub fn new(fetcher: AssetFetcher, refresh: &RefreshConfig) -> Self {
    Self {
      flows: FlowReader::new(fetcher.clone()),
      playbooks: PlaybookReader::new(fetcher.clone()),
      schemas: SchemaReader::new(fetcher.clone()),
      refresh: RefreshPool::new(fetcher.clone(), refresh.workers, refresh.queue_capacity),
      fetcher,
      offline: None,
    }
  }

  /// Consult `offline` before any remote call.
  pub fn with_offline(mut self, offline: Arc<OfflineManager>) -> Self {
    self.offline = Some(offline);
    self
  }

  pub fn fetcher(&self) -> &AssetFetcher {
    &self.fetcher
  }

  pub fn store(&self) -> &Arc<CacheStore> {
    self.fetcher.store()
  }

  pub fn lifecycle(&self) -> &LifecycleManager {
    self.fetcher.lifecycle()
  }

  pub fn schemas(&self) -> &SchemaReader {
    &self.schemas
  }

  fn is_offline(&self) -> bool {
    self
      .offline
      .as_ref()
      .is_some_and(|offline| !offline.can_perform_operation(Operation::FetchAsset))
  }

  pub async fn get_flow(
    &self,
    namespace: &str,
    id: &str,
    version: Option<&str>,
    force_refresh: bool,
  ) -> Result<Option<Arc<LoadedAsset<serde_json::Value>>>, UriError> {
    let uri = FlowReader::uri(namespace, id, version);
    self.read(&self.flows, &uri, None, force_refresh).await
  }

  pub async fn get_playbook(
    &self,
    namespace: &str,
    id: &str,
    version: Option<&str>,
    locale: Option<&str>,
    force_refresh: bool,
  ) -> Result<Option<Arc<LoadedAsset<Playbook>>>, UriError> {
    let uri = PlaybookReader::uri(namespace, id, version);
    self.read(&self.playbooks, &uri, locale, force_refresh).await
  }

  pub async fn get_schema(
    &self,
    namespace: &str,
    id: &str,
    version: Option<&str>,
    force_refresh: bool,
  ) -> Result<Option<Arc<LoadedAsset<serde_json::Value>>>, UriError> {
    let uri = SchemaReader::uri(namespace, id, version);
    self.read(&self.schemas, &uri, None, force_refresh).await
  }

  async fn read<F: AssetFormat>(
    &self,
    reader: &AssetReader<F>,
    uri: &AssetUri,
    locale: Option<&str>,
    force_refresh: bool,
  ) -> Result<Option<Arc<LoadedAsset<F::Output>>>, UriError> {
    match self.plan_read(uri, force_refresh) {
      ReadPlan::Cached { refresh } => {
        let loaded = reader.load_uri(uri, locale, false, false).await?;
        if refresh {
          self.refresh_later(uri).await;
        }
        Ok(loaded)
      }
      ReadPlan::Remote => {
        if self.fetcher.fetch_asset(&uri.to_string(), force_refresh).await?.is_none() {
          debug!(uri = %uri, "fetch returned nothing, using whatever is cached");
        }
        reader.load_uri(uri, locale, true, false).await
      }
    }
  }

  /// Decide how a read of `uri` proceeds. A copy served past its TTL asks
  /// for a refresh.
  fn plan_read(&self, uri: &AssetUri, force_refresh: bool) -> ReadPlan {
    let status = self.lifecycle().get_asset_status(uri);
    let offline = self.is_offline();
    if !offline && (force_refresh || !status.is_servable()) {
      return ReadPlan::Remote;
    }
    if offline {
      debug!(uri = %uri, %status, "offline, reading from cache only");
    }
    ReadPlan::Cached {
      refresh: matches!(status, CacheLifecycle::Stale | CacheLifecycle::Expired),
    }
  }

  /// Hand `uri` to the refresh pool, or park the refresh with the offline
  /// manager until the remote is back. Returns whether a refresh is pending.
  async fn refresh_later(&self, uri: &AssetUri) -> bool {
    let raw = uri.to_string();
    match &self.offline {
      Some(offline) if self.is_offline() => {
        let fetcher = self.fetcher.clone();
        let task = DeferredTask::new(format!("refresh {}", raw), move || {
          async move {
            fetcher.fetch_asset(&raw, true).await?;
            Ok::<(), color_eyre::Report>(())
          }
          .boxed()
        });
        offline.defer_once(task).await;
        true
      }
      _ => self.refresh.schedule(&raw),
    }
  }

  /// Refresh every EXPIRED asset in `uris`. With `background` the refreshes
  /// are queued and this returns without waiting for them. Offline, every
  /// refresh is deferred until reconnect.
  pub async fn check_and_update_assets<'a>(
    &self,
    uris: impl IntoIterator<Item = &'a str>,
    background: bool,
  ) -> Result<RefreshReport, UriError> {
    let mut report = RefreshReport::default();
    let parsed = uris
      .into_iter()
      .map(AssetUri::parse)
      .collect::<Result<Vec<_>, _>>()?;

    for uri in parsed {
      report.checked += 1;
      if self.lifecycle().get_asset_status(&uri) != CacheLifecycle::Expired {
        continue;
      }
      report.expired += 1;

      if background || self.is_offline() {
        if self.refresh_later(&uri).await {
          report.scheduled += 1;
        } else {
          report.failed += 1;
        }
        continue;
      }

      self.fetcher.fetch_asset(&uri.to_string(), true).await?;
      if self.lifecycle().is_asset_valid(&uri) {
        report.refreshed += 1;
      } else {
        report.failed += 1;
      }
    }

    if report.expired > 0 {
      info!(
        checked = report.checked,
        expired = report.expired,
        refreshed = report.refreshed,
        scheduled = report.scheduled,
        failed = report.failed,
        "checked assets for expiry"
      );
    }
    Ok(report)
  }

  /// Queue a background refresh of `uri` regardless of its status.
  pub async fn schedule_refresh(&self, uri: &AssetUri) -> bool {
    self.refresh_later(uri).await
  }

  /// Raw bytes of an asset, fetching when needed. The result says whether the
  /// bytes came from the network or were served from cache.
  pub async fn fetch(
    &self,
    uri: &str,
    force_refresh: bool,
  ) -> Result<Option<CacheResult<Vec<u8>>>, UriError> {
    let parsed = AssetUri::parse(uri)?;
    if let ReadPlan::Cached { refresh } = self.plan_read(&parsed, force_refresh) {
      let cached = self.get_cached(uri)?;
      let scheduled = refresh && self.refresh_later(&parsed).await;
      return Ok(cached.map(|cached| cached.with_refresh_scheduled(scheduled)));
    }

    let started = Utc::now();
    if self.fetcher.fetch_asset(uri, force_refresh).await?.is_none() {
      return Ok(None);
    }

    let entry = match self.store().get_manifest_entry(&parsed) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(uri = %parsed, error = %e, "failed to read manifest entry");
        None
      }
    };
    let bytes = self.read_bytes(&parsed);
    Ok(match (bytes, entry) {
      (Some(bytes), Some(entry)) if entry.cached_at >= started => {
        Some(CacheResult::from_network(bytes))
      }
      (Some(bytes), Some(entry)) => Some(CacheResult::offline(bytes, entry.cached_at)),
      (Some(bytes), None) => Some(CacheResult::from_network(bytes)),
      (None, _) => None,
    })
  }

  /// Cached bytes without touching the network. EXPIRED content is still
  /// returned, marked as an offline read.
  pub fn get_cached(&self, uri: &str) -> Result<Option<CacheResult<Vec<u8>>>, UriError> {
    let parsed = AssetUri::parse(uri)?;
    let entry = match self.store().get_manifest_entry(&parsed) {
      Ok(Some(entry)) => entry,
      Ok(None) => return Ok(None),
      Err(e) => {
        warn!(uri = %parsed, error = %e, "failed to read manifest entry");
        return Ok(None);
      }
    };
    let Some(bytes) = self.read_bytes(&parsed) else {
      return Ok(None);
    };

    Ok(Some(match self.lifecycle().get_asset_status(&parsed) {
      CacheLifecycle::Valid => CacheResult::from_cache(bytes, entry.cached_at, false),
      CacheLifecycle::Stale => CacheResult::from_cache(bytes, entry.cached_at, true),
      CacheLifecycle::Expired | CacheLifecycle::Invalid => {
        warn!(uri = %parsed, "serving expired asset from cache");
        CacheResult::offline(bytes, entry.cached_at)
      }
    }))
  }

  fn read_bytes(&self, uri: &AssetUri) -> Option<Vec<u8>> {
    match self.store().get_asset(uri) {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(uri = %uri, error = %e, "failed to read cached asset");
        None
      }
    }
  }

  /// Stop the refresh pool after it drains, and drop parsed assets.
  pub async fn close(&self) {
    self.refresh.shutdown().await;
    self.flows.clear_memory();
    self.playbooks.clear_memory();
    self.schemas.clear_memory();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::types::CacheSource;
  use crate::config::ConnectivityConfig;
  use crate::connectivity::{ConnectivityMonitor, HealthProbe, ProbeFailure};
  use crate::error::SyncError;
  use crate::test_support::{assets_response, remote_asset, ScriptedApi};
  use async_trait::async_trait;
  use chrono::Duration;
  use tempfile::TempDir;

  const FLOW: &str = "asset://flow/acme/intake@1";

  fn setup() -> (TempDir, Arc<ScriptedApi>, AssetCache) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(dir.path()).unwrap());
    let api = Arc::new(ScriptedApi::default());
    let cache = AssetCache::new(
      AssetFetcher::new(store, api.clone()),
      &RefreshConfig {
        workers: 1,
        queue_capacity: 8,
      },
    );
    (dir, api, cache)
  }

  fn expire(cache: &AssetCache, uri: &str, ago: Duration) {
    let parsed = AssetUri::parse(uri).unwrap();
    cache.store().set_expires_at(&parsed, Utc::now() - ago);
  }

  #[tokio::test]
  async fn test_get_flow_force_refresh_reloads() {
    let (_dir, api, cache) = setup();
    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"name: v1")])));
    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"name: v2")])));

    let first = cache.get_flow("acme", "intake", Some("1"), false).await.unwrap().unwrap();
    assert_eq!(first.data["name"], "v1");
    let cached = cache.get_flow("acme", "intake", Some("1"), false).await.unwrap().unwrap();
    assert_eq!(cached.data["name"], "v1");
    let forced = cache.get_flow("acme", "intake", Some("1"), true).await.unwrap().unwrap();
    assert_eq!(forced.data["name"], "v2");
    assert_eq!(api.fetch_count(), 2);
    cache.close().await;
  }

  #[tokio::test]
  async fn test_check_and_update_refreshes_expired_only() {
    let (_dir, api, cache) = setup();
    let fresh = "asset://flow/acme/fresh@1";
    api.push_fetch(Ok(assets_response(vec![
      remote_asset(FLOW, b"old"),
      remote_asset(fresh, b"fresh"),
    ])));
    cache.fetcher().fetch_assets([FLOW, fresh], false).await.unwrap();
    expire(&cache, FLOW, Duration::hours(3));

    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"new")])));
    let report = cache.check_and_update_assets([FLOW, fresh], false).await.unwrap();
    assert_eq!(
      report,
      RefreshReport {
        checked: 2,
        expired: 1,
        refreshed: 1,
        scheduled: 0,
        failed: 0,
      }
    );
    let bytes = cache.get_cached(FLOW).unwrap().unwrap();
    assert_eq!(bytes.data, b"new");
    assert_eq!(bytes.source, CacheSource::CacheFresh);
    cache.close().await;
  }

  #[tokio::test]
  async fn test_background_refresh_completes_on_close() {
    let (_dir, api, cache) = setup();
    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"old")])));
    cache.fetch(FLOW, false).await.unwrap();
    expire(&cache, FLOW, Duration::hours(3));

    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"new")])));
    let report = cache.check_and_update_assets([FLOW], true).await.unwrap();
    assert_eq!(report.scheduled, 1);
    cache.close().await;

    assert_eq!(cache.get_cached(FLOW).unwrap().unwrap().data, b"new");
  }

  #[tokio::test]
  async fn test_fetch_reports_source() {
    let (_dir, api, cache) = setup();
    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"body")])));

    let first = cache.fetch(FLOW, false).await.unwrap().unwrap();
    assert_eq!(first.source, CacheSource::Network);
    let second = cache.fetch(FLOW, false).await.unwrap().unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);

    api.push_fetch(Err(SyncError::network("down")));
    let degraded = cache.fetch(FLOW, true).await.unwrap().unwrap();
    assert_eq!(degraded.source, CacheSource::Offline);
    assert_eq!(degraded.data, b"body");
    cache.close().await;
  }

  #[tokio::test]
  async fn test_get_cached_never_fetches() {
    let (_dir, api, cache) = setup();
    assert!(cache.get_cached(FLOW).unwrap().is_none());
    assert_eq!(api.fetch_count(), 0);
    cache.close().await;
  }

  #[tokio::test]
  async fn test_stale_read_is_served_then_refreshed() {
    let (_dir, api, cache) = setup();
    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"name: v1")])));
    cache.fetch(FLOW, false).await.unwrap();
    expire(&cache, FLOW, Duration::minutes(30));

    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"name: v2")])));
    let stale = cache.fetch(FLOW, false).await.unwrap().unwrap();
    assert_eq!(stale.source, CacheSource::CacheStale);
    assert_eq!(stale.data, b"name: v1");
    assert!(stale.refresh_scheduled);

    cache.close().await;
    assert_eq!(api.fetch_count(), 2);
    let refreshed = cache.get_cached(FLOW).unwrap().unwrap();
    assert_eq!(refreshed.data, b"name: v2");
    assert_eq!(refreshed.source, CacheSource::CacheFresh);
  }

  #[tokio::test]
  async fn test_stale_typed_read_schedules_refresh() {
    let (_dir, api, cache) = setup();
    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"name: v1")])));
    let first = cache.get_flow("acme", "intake", Some("1"), false).await.unwrap().unwrap();
    assert_eq!(first.data["name"], "v1");
    expire(&cache, FLOW, Duration::minutes(30));

    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"name: v2")])));
    let stale = cache.get_flow("acme", "intake", Some("1"), false).await.unwrap().unwrap();
    assert_eq!(stale.data["name"], "v1");

    cache.close().await;
    assert_eq!(api.fetch_count(), 2);
    let refreshed = cache.get_flow("acme", "intake", Some("1"), false).await.unwrap().unwrap();
    assert_eq!(refreshed.data["name"], "v2");
    assert_eq!(api.fetch_count(), 2);
  }

  struct DownProbe;

  #[async_trait]
  impl HealthProbe for DownProbe {
    async fn probe(&self) -> std::result::Result<(), ProbeFailure> {
      Err(ProbeFailure::Timeout)
    }
  }

  #[tokio::test]
  async fn test_offline_reads_never_reach_the_remote() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(dir.path()).unwrap());
    let api = Arc::new(ScriptedApi::default());
    let monitor = ConnectivityMonitor::new(Arc::new(DownProbe), &ConnectivityConfig::default());
    let offline = OfflineManager::new(&monitor);
    let cache = AssetCache::new(
      AssetFetcher::new(Arc::clone(&store), api.clone()),
      &RefreshConfig {
        workers: 1,
        queue_capacity: 8,
      },
    )
    .with_offline(Arc::clone(&offline));

    let parsed = AssetUri::parse(FLOW).unwrap();
    store.store_asset(&parsed, b"name: old", None, None).unwrap();
    expire(&cache, FLOW, Duration::hours(3));

    let served = cache.fetch(FLOW, false).await.unwrap().unwrap();
    assert_eq!(served.data, b"name: old");
    assert_eq!(served.source, CacheSource::Offline);
    assert!(served.refresh_scheduled);
    let forced = cache.fetch(FLOW, true).await.unwrap().unwrap();
    assert_eq!(forced.data, b"name: old");
    assert!(cache
      .get_schema("acme", "missing", Some("1"), false)
      .await
      .unwrap()
      .is_none());
    assert_eq!(api.fetch_count(), 0);
    // One refresh is parked no matter how often the asset is read.
    assert_eq!(offline.pending_count().await, 1);

    monitor.record_success();
    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"name: new")])));
    assert_eq!(offline.drain_pending().await, 1);
    assert_eq!(api.fetch_count(), 1);
    assert_eq!(cache.get_cached(FLOW).unwrap().unwrap().data, b"name: new");
    cache.close().await;
  }
}
