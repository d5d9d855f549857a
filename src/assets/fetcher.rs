//! Remote asset fetching with checksum verification and cache write-through.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::patch::{apply_patch, parse_patch};
use crate::cache::lifecycle::LifecycleManager;
use crate::cache::storage::CacheStore;
use crate::remote::api_types::{DiffType, FetchAssetsRequest, RemoteAsset};
use crate::remote::SyncApi;
use crate::uri::{AssetKind, AssetUri, UriError, LATEST};

/// Fetches assets from the remote and writes them into the [`CacheStore`].
///
/// Cache-first: VALID and STALE entries short-circuit unless a refresh is
/// forced. Network failures never escape; the caller gets the existing cached
/// copy when there is one, `None` otherwise. Only malformed URIs are errors.
/// The fetcher does not queue refreshes of STALE hits or consult the offline
/// manager; [`AssetCache`](crate::cache::AssetCache) does both.
#[derive(Clone)]
pub struct AssetFetcher {
  store: Arc<CacheStore>,
  lifecycle: LifecycleManager,
  api: Arc<dyn SyncApi>,
}

impl AssetFetcher {
  pub fn new(store: Arc<CacheStore>, api: Arc<dyn SyncApi>) -> Self {
    let lifecycle = LifecycleManager::new(Arc::clone(&store));
    Self {
      store,
      lifecycle,
      api,
    }
  }

  pub fn store(&self) -> &Arc<CacheStore> {
    &self.store
  }

  pub fn lifecycle(&self) -> &LifecycleManager {
    &self.lifecycle
  }

  pub async fn fetch_asset(&self, uri: &str, force_refresh: bool) -> Result<Option<PathBuf>, UriError> {
    let mut results = self.fetch_assets([uri], force_refresh).await?;
    Ok(results.remove(uri).flatten())
  }

  /// Fetch a batch in one request. The returned map is keyed by the URIs as
  /// passed in.
  pub async fn fetch_assets<'a>(
    &self,
    uris: impl IntoIterator<Item = &'a str>,
    force_refresh: bool,
  ) -> Result<HashMap<String, Option<PathBuf>>, UriError> {
    let parsed = uris
      .into_iter()
      .map(|raw| AssetUri::parse(raw).map(|uri| (raw.to_string(), uri)))
      .collect::<Result<Vec<_>, _>>()?;

    let mut results = HashMap::new();
    let mut pending = Vec::new();
    for (raw, uri) in parsed {
      if !force_refresh {
        let status = self.lifecycle.get_asset_status(&uri);
        if status.is_servable() {
          debug!(uri = %uri, %status, "serving asset from cache");
          results.insert(raw, Some(self.store.get_asset_path(&uri)));
          continue;
        }
      }
      pending.push((raw, uri));
    }

    if pending.is_empty() {
      return Ok(results);
    }

    let wanted: Vec<String> = pending.iter().map(|(_, uri)| uri.to_string()).collect();
    let request = FetchAssetsRequest::full(wanted.iter().map(String::as_str));

    match self.api.fetch_assets(&request).await {
      Ok(response) => {
        for (raw, uri) in pending {
          let path = match find_asset(&response.assets, &uri) {
            Some(asset) => match self.write_remote_asset(&uri, asset) {
              Ok(path) => Some(path),
              Err(e) => {
                warn!(uri = %uri, error = %e, "rejected fetched asset");
                self.cached_fallback(&uri)
              }
            },
            None => {
              warn!(uri = %uri, "remote returned no content for asset");
              self.cached_fallback(&uri)
            }
          };
          results.insert(raw, path);
        }
      }
      Err(e) => {
        warn!(error = %e, count = pending.len(), "asset fetch failed");
        for (raw, uri) in pending {
          results.insert(raw, self.cached_fallback(&uri));
        }
      }
    }

    Ok(results)
  }

  /// Ask the remote for a diff against `base_version` and apply it.
  ///
  /// `full_replace`, missing diffs and the unsupported `text_diff` fall back
  /// to a forced full fetch. A `json_patch` that fails to apply leaves the
  /// cache untouched.
  pub async fn fetch_incremental(
    &self,
    uri: &str,
    base_version: &str,
  ) -> Result<Option<PathBuf>, UriError> {
    let target = AssetUri::parse(uri)?;
    let request = FetchAssetsRequest::incremental(&target.to_string(), base_version);

    let response = match self.api.fetch_assets(&request).await {
      Ok(response) => response,
      Err(e) => {
        warn!(uri = %target, error = %e, "incremental fetch failed");
        return Ok(self.cached_fallback(&target));
      }
    };

    if let Some(asset) = find_asset(&response.assets, &target) {
      return match self.write_remote_asset(&target, asset) {
        Ok(path) => Ok(Some(path)),
        Err(e) => {
          warn!(uri = %target, error = %e, "rejected fetched asset");
          Ok(self.cached_fallback(&target))
        }
      };
    }

    let diff = response.diffs.iter().find(|d| {
      AssetUri::parse(&d.uri)
        .map(|u| u.same_asset(&target))
        .unwrap_or(false)
    });

    let diff = match diff {
      Some(diff) => diff,
      None => {
        warn!(uri = %target, "no diff returned, falling back to full fetch");
        return self.fetch_asset(uri, true).await;
      }
    };

    match diff.diff_type {
      DiffType::JsonPatch => {
        match self.apply_json_patch(&target, base_version, &diff.diff) {
          Ok(Some(path)) => Ok(Some(path)),
          Ok(None) => self.fetch_asset(uri, true).await,
          Err(e) => {
            warn!(uri = %target, error = %e, "json patch rejected, keeping cached copy");
            Ok(self.cached_fallback(&target))
          }
        }
      }
      DiffType::FullReplace => self.fetch_asset(uri, true).await,
      DiffType::TextDiff | DiffType::Unknown => {
        warn!(
          uri = %target,
          diff_type = ?diff.diff_type,
          "diff type not supported, falling back to full fetch"
        );
        self.fetch_asset(uri, true).await
      }
    }
  }

  /// Decode, verify and store one fetched asset. A checksum mismatch is an
  /// error and nothing is written.
  pub fn write_remote_asset(&self, uri: &AssetUri, asset: &RemoteAsset) -> Result<PathBuf> {
    let bytes = asset
      .decode_content()
      .map_err(|e| eyre!("Failed to decode content for {}: {}", uri, e))?;
    let metadata = if asset.metadata.is_empty() {
      None
    } else {
      Some(asset.metadata.clone())
    };
    let path = self
      .store
      .store_asset(uri, &bytes, asset.checksum.as_deref(), metadata)?;
    info!(uri = %uri, bytes = bytes.len(), "cached fetched asset");
    Ok(path)
  }

  /// Patch the cached base version. `Ok(None)` means there is no usable base
  /// and the caller should fetch in full.
  fn apply_json_patch(
    &self,
    target: &AssetUri,
    base_version: &str,
    diff: &serde_json::Value,
  ) -> Result<Option<PathBuf>> {
    if !matches!(target.kind.extension(), "json" | "yaml") {
      return Ok(None);
    }

    let base_uri = target.with_version(base_version);
    let base = match self.store.get_asset(&base_uri)? {
      Some(bytes) => bytes,
      None => match self.store.get_asset(target)? {
        Some(bytes) => bytes,
        None => return Ok(None),
      },
    };

    let doc = decode_document(target.kind, &base)?;
    let ops = parse_patch(diff)?;
    let patched = apply_patch(&doc, &ops)?;
    let bytes = encode_document(target.kind, &patched)?;

    let path = self.store.store_asset(target, &bytes, None, None)?;
    info!(uri = %target, base = base_version, "applied incremental patch");
    Ok(Some(path))
  }

  fn cached_fallback(&self, uri: &AssetUri) -> Option<PathBuf> {
    let path = self.store.get_asset_path(uri);
    if path.exists() {
      warn!(uri = %uri, "serving cached copy after failed refresh (degraded read)");
      Some(path)
    } else {
      None
    }
  }
}

/// Exact version match first; a `latest` request accepts any version of the
/// same asset.
fn find_asset<'a>(assets: &'a [RemoteAsset], uri: &AssetUri) -> Option<&'a RemoteAsset> {
  let parsed: Vec<(&RemoteAsset, AssetUri)> = assets
    .iter()
    .filter_map(|a| AssetUri::parse(&a.uri).ok().map(|u| (a, u)))
    .collect();

  parsed
    .iter()
    .find(|(_, u)| u.key() == uri.key())
    .or_else(|| {
      if uri.version == LATEST {
        parsed.iter().find(|(_, u)| u.same_asset(uri))
      } else {
        None
      }
    })
    .map(|(a, _)| *a)
}

fn decode_document(kind: AssetKind, bytes: &[u8]) -> Result<serde_json::Value> {
  match kind.extension() {
    "yaml" => serde_yaml::from_slice(bytes).map_err(|e| eyre!("Cached YAML is invalid: {}", e)),
    _ => serde_json::from_slice(bytes).map_err(|e| eyre!("Cached JSON is invalid: {}", e)),
  }
}

fn encode_document(kind: AssetKind, value: &serde_json::Value) -> Result<Vec<u8>> {
  match kind.extension() {
    "yaml" => serde_yaml::to_string(value)
      .map(String::into_bytes)
      .map_err(|e| eyre!("Failed to encode YAML: {}", e)),
    _ => serde_json::to_vec_pretty(value).map_err(|e| eyre!("Failed to encode JSON: {}", e)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::SyncError;
  use crate::remote::api_types::{AssetDiff, FetchAssetsResponse};
  use crate::test_support::{assets_response, remote_asset, ScriptedApi};
  use serde_json::json;
  use tempfile::TempDir;

  const FLOW: &str = "asset://flow/acme/onboarding@1";
  const SCHEMA: &str = "asset://schema/acme/ticket@2";

  fn setup() -> (TempDir, Arc<ScriptedApi>, AssetFetcher) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(dir.path()).unwrap());
    let api = Arc::new(ScriptedApi::default());
    let fetcher = AssetFetcher::new(store, api.clone());
    (dir, api, fetcher)
  }

  fn read(path: &std::path::Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
  }

  #[tokio::test]
  async fn test_miss_fetches_and_writes_through() {
    let (_dir, api, fetcher) = setup();
    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"steps: [a]")])));

    let path = fetcher.fetch_asset(FLOW, false).await.unwrap().unwrap();
    assert_eq!(read(&path), b"steps: [a]");
    assert_eq!(api.fetch_count(), 1);

    // Second call is served from cache without a request.
    let again = fetcher.fetch_asset(FLOW, false).await.unwrap().unwrap();
    assert_eq!(again, path);
    assert_eq!(api.fetch_count(), 1);
  }

  #[tokio::test]
  async fn test_force_refresh_bypasses_cache() {
    let (_dir, api, fetcher) = setup();
    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"v1")])));
    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"v2")])));

    fetcher.fetch_asset(FLOW, false).await.unwrap();
    let path = fetcher.fetch_asset(FLOW, true).await.unwrap().unwrap();
    assert_eq!(read(&path), b"v2");
    assert_eq!(api.fetch_count(), 2);
  }

  #[tokio::test]
  async fn test_checksum_mismatch_is_not_cached() {
    let (_dir, api, fetcher) = setup();
    let mut asset = remote_asset(FLOW, b"tampered");
    asset.checksum = Some("sha256:0000".into());
    api.push_fetch(Ok(assets_response(vec![asset.clone()])));

    assert_eq!(fetcher.fetch_asset(FLOW, false).await.unwrap(), None);
    let uri = AssetUri::parse(FLOW).unwrap();
    assert!(fetcher.store().get_asset(&uri).unwrap().is_none());
    assert!(fetcher.write_remote_asset(&uri, &asset).is_err());
  }

  #[tokio::test]
  async fn test_checksum_mismatch_keeps_previous_entry() {
    let (_dir, api, fetcher) = setup();
    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"good")])));
    let mut bad = remote_asset(FLOW, b"bad");
    bad.checksum = Some("sha256:ffff".into());
    api.push_fetch(Ok(assets_response(vec![bad])));

    fetcher.fetch_asset(FLOW, false).await.unwrap();
    let path = fetcher.fetch_asset(FLOW, true).await.unwrap().unwrap();
    assert_eq!(read(&path), b"good");
  }

  #[tokio::test]
  async fn test_network_failure_serves_cached_copy() {
    let (_dir, api, fetcher) = setup();
    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"cached")])));
    api.push_fetch(Err(SyncError::network("connection refused")));

    fetcher.fetch_asset(FLOW, false).await.unwrap();
    let path = fetcher.fetch_asset(FLOW, true).await.unwrap().unwrap();
    assert_eq!(read(&path), b"cached");
  }

  #[tokio::test]
  async fn test_network_failure_without_cache_returns_none() {
    let (_dir, api, fetcher) = setup();
    api.push_fetch(Err(SyncError::network("connection refused")));
    assert_eq!(fetcher.fetch_asset(FLOW, false).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_malformed_uri_is_an_error() {
    let (_dir, _api, fetcher) = setup();
    assert!(fetcher.fetch_asset("asset://flow/only-two", false).await.is_err());
  }

  #[tokio::test]
  async fn test_batch_fetch_keys_results_by_input() {
    let (_dir, api, fetcher) = setup();
    let latest = "asset://flow/acme/intake";
    api.push_fetch(Ok(assets_response(vec![
      remote_asset(FLOW, b"one"),
      remote_asset("asset://flow/acme/intake@3.0", b"intake"),
    ])));

    let results = fetcher
      .fetch_assets([FLOW, latest, SCHEMA], false)
      .await
      .unwrap();
    assert_eq!(results.len(), 3);
    assert!(results[FLOW].is_some());
    assert_eq!(read(results[latest].as_ref().unwrap()), b"intake");
    assert!(results[SCHEMA].is_none());
    assert_eq!(api.fetch_requests.lock().unwrap()[0].assets.len(), 3);
  }

  #[tokio::test]
  async fn test_incremental_json_patch() {
    let (_dir, api, fetcher) = setup();
    let base = "asset://schema/acme/ticket@1";
    api.push_fetch(Ok(assets_response(vec![remote_asset(
      base,
      br#"{"title":"Ticket","required":["id"]}"#,
    )])));
    fetcher.fetch_asset(base, false).await.unwrap();

    api.push_fetch(Ok(FetchAssetsResponse {
      assets: vec![],
      diffs: vec![AssetDiff {
        uri: SCHEMA.into(),
        diff_type: DiffType::JsonPatch,
        diff: json!([{"op": "add", "path": "/required/-", "value": "status"}]),
      }],
    }));

    let path = fetcher.fetch_incremental(SCHEMA, "1").await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_slice(&read(&path)).unwrap();
    assert_eq!(value["required"], json!(["id", "status"]));
    let request = &api.fetch_requests.lock().unwrap()[1];
    assert_eq!(request.incremental.as_ref().unwrap().base_versions[0].version, "1");
  }

  #[tokio::test]
  async fn test_incremental_bad_patch_leaves_cache_untouched() {
    let (_dir, api, fetcher) = setup();
    api.push_fetch(Ok(assets_response(vec![remote_asset(SCHEMA, br#"{"a":1}"#)])));
    fetcher.fetch_asset(SCHEMA, false).await.unwrap();

    api.push_fetch(Ok(FetchAssetsResponse {
      assets: vec![],
      diffs: vec![AssetDiff {
        uri: SCHEMA.into(),
        diff_type: DiffType::JsonPatch,
        diff: json!([{"op": "remove", "path": "/missing"}]),
      }],
    }));

    let path = fetcher.fetch_incremental(SCHEMA, "2").await.unwrap().unwrap();
    assert_eq!(read(&path), br#"{"a":1}"#);
    assert_eq!(api.fetch_count(), 2);
  }

  #[tokio::test]
  async fn test_text_diff_falls_back_to_full_fetch() {
    let (_dir, api, fetcher) = setup();
    api.push_fetch(Ok(FetchAssetsResponse {
      assets: vec![],
      diffs: vec![AssetDiff {
        uri: FLOW.into(),
        diff_type: DiffType::TextDiff,
        diff: json!("@@ -1 +1 @@"),
      }],
    }));
    api.push_fetch(Ok(assets_response(vec![remote_asset(FLOW, b"full")])));

    let path = fetcher.fetch_incremental(FLOW, "0").await.unwrap().unwrap();
    assert_eq!(read(&path), b"full");
    let requests = api.fetch_requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].incremental.is_none());
  }
}
