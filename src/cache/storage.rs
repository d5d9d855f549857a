//! Filesystem cache store with a manifest index.
//!
//! Layout under the cache root:
//!
//! ```text
//! manifest.json
//! {kind_dir}/{namespace}/{id}/{version}/asset.{ext}
//! {kind_dir}/{namespace}/{id}/{version}/metadata.json
//! ```

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use super::types::{AssetMetadata, CacheLifecycle};
use crate::uri::{AssetKind, AssetUri};

const MANIFEST_FILE: &str = "manifest.json";
const METADATA_FILE: &str = "metadata.json";

/// Declared checksum did not match the bytes being written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("checksum mismatch for {uri}: expected {expected}, got {actual}")]
pub struct ChecksumMismatch {
  pub uri: String,
  pub expected: String,
  pub actual: String,
}

/// One manifest row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
  /// Content file under the cache root
  pub path: PathBuf,
  /// `sha256:<hex>` of the stored bytes
  pub checksum: String,
  /// When the content was written
  pub cached_at: DateTime<Utc>,
  /// `cached_at` plus the per-kind TTL
  pub expires_at: DateTime<Utc>,
  pub size_bytes: u64,
  /// Classification at write time; recomputed on every query
  pub status: CacheLifecycle,
}

/// Process-wide index of everything in the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
  /// Generated on first open unless configured
  #[serde(default)]
  pub device_id: Option<String>,
  /// Server time of the last successful version check
  #[serde(default)]
  pub last_sync: Option<DateTime<Utc>>,
  /// License payload returned by the version check
  #[serde(default)]
  pub license: Option<serde_json::Value>,
  /// Entries keyed by canonical asset URI
  #[serde(default)]
  pub assets: BTreeMap<String, ManifestEntry>,
}

/// Aggregate numbers about the cache contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  /// Manifest entries
  pub asset_count: usize,
  /// Sum of `size_bytes` over all entries
  pub total_bytes: u64,
}

/// Compute the `sha256:<hex>` checksum of a byte slice.
pub fn sha256_checksum(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Compare a declared checksum against a computed one. The `sha256:` prefix
/// is optional on the declared side and hex case is ignored.
pub fn checksum_matches(declared: &str, computed: &str) -> bool {
  let declared = declared.trim();
  let declared = declared.strip_prefix("sha256:").unwrap_or(declared);
  let computed = computed.strip_prefix("sha256:").unwrap_or(computed);
  declared.eq_ignore_ascii_case(computed)
}

/// Local asset cache rooted at a directory.
///
/// The manifest is held in memory behind a mutex and rewritten to disk after
/// every mutation. One writer process per root is assumed; there is no
/// cross-process lock.
pub struct CacheStore {
  root: PathBuf,
  manifest: Mutex<Manifest>,
}

impl CacheStore {
  /// Open the cache at `root`, creating the directory tree and manifest if
  /// they do not exist yet.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
    let root = root.into();
    std::fs::create_dir_all(&root)
      .map_err(|e| eyre!("Failed to create cache directory {}: {}", root.display(), e))?;
    for kind in AssetKind::ALL {
      let dir = root.join(kind.dir_name());
      std::fs::create_dir_all(&dir)
        .map_err(|e| eyre!("Failed to create cache directory {}: {}", dir.display(), e))?;
    }

    let manifest_path = root.join(MANIFEST_FILE);
    let manifest = match std::fs::read(&manifest_path) {
      Ok(bytes) => serde_json::from_slice::<Manifest>(&bytes).map_err(|e| {
        eyre!(
          "Failed to parse cache manifest {}: {}",
          manifest_path.display(),
          e
        )
      })?,
      Err(e) if e.kind() == ErrorKind::NotFound => {
        let manifest = Manifest {
          device_id: Some(uuid::Uuid::new_v4().to_string()),
          ..Manifest::default()
        };
        write_json_atomic(&manifest_path, &manifest)?;
        debug!(root = %root.display(), "created cache manifest");
        manifest
      }
      Err(e) => {
        return Err(eyre!(
          "Failed to read cache manifest {}: {}",
          manifest_path.display(),
          e
        ))
      }
    };

    Ok(Self {
      root,
      manifest: Mutex::new(manifest),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Directory holding one version of one asset.
  pub fn asset_dir(&self, uri: &AssetUri) -> PathBuf {
    let mut dir = self.root.join(uri.kind.dir_name()).join(&uri.namespace);
    for part in uri.id.split('/') {
      dir.push(part);
    }
    dir.join(&uri.version)
  }

  /// Path of the content file for `uri`, whether or not it exists.
  pub fn get_asset_path(&self, uri: &AssetUri) -> PathBuf {
    self
      .asset_dir(uri)
      .join(format!("asset.{}", uri.kind.extension()))
  }

  /// Write `bytes` for `uri`, with its metadata file and manifest entry.
  ///
  /// When `checksum` is given it must match the content; on mismatch nothing
  /// is written and a [`ChecksumMismatch`] is returned.
  pub fn store_asset(
    &self,
    uri: &AssetUri,
    bytes: &[u8],
    checksum: Option<&str>,
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
  ) -> Result<PathBuf> {
    let computed = sha256_checksum(bytes);
    if let Some(declared) = checksum {
      if !checksum_matches(declared, &computed) {
        return Err(
          ChecksumMismatch {
            uri: uri.to_string(),
            expected: declared.to_string(),
            actual: computed,
          }
          .into(),
        );
      }
    }

    let dir = self.asset_dir(uri);
    std::fs::create_dir_all(&dir)
      .map_err(|e| eyre!("Failed to create asset directory {}: {}", dir.display(), e))?;

    let path = self.get_asset_path(uri);
    let cached_at = Utc::now();
    let expires_at = cached_at + uri.kind.ttl();

    let asset_meta = AssetMetadata {
      uri: uri.to_string(),
      kind: uri.kind,
      path: path.clone(),
      checksum: computed.clone(),
      content_type: uri.kind.content_type().to_string(),
      size_bytes: bytes.len() as u64,
      cached_at,
      expires_at,
      status: CacheLifecycle::Valid,
      extra: metadata.unwrap_or_default(),
    };

    // Hold the manifest lock across the file writes so the content,
    // metadata file and manifest row for one URI are never interleaved.
    let mut manifest = self
      .manifest
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    write_bytes_atomic(&path, bytes)?;
    write_json_atomic(&dir.join(METADATA_FILE), &asset_meta)?;

    manifest.assets.insert(
      uri.to_string(),
      ManifestEntry {
        path: path.clone(),
        checksum: computed,
        cached_at,
        expires_at,
        size_bytes: asset_meta.size_bytes,
        status: CacheLifecycle::Valid,
      },
    );
    self.persist(&manifest)?;

    debug!(uri = %uri, bytes = bytes.len(), "stored asset");
    Ok(path)
  }

  /// Read the cached content for `uri`.
  pub fn get_asset(&self, uri: &AssetUri) -> Result<Option<Vec<u8>>> {
    let path = self.get_asset_path(uri);
    match std::fs::read(&path) {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(eyre!("Failed to read asset {}: {}", path.display(), e)),
    }
  }

  /// Read the metadata file for `uri`.
  pub fn get_asset_metadata(&self, uri: &AssetUri) -> Result<Option<AssetMetadata>> {
    let path = self.asset_dir(uri).join(METADATA_FILE);
    match std::fs::read(&path) {
      Ok(bytes) => {
        let meta = serde_json::from_slice(&bytes)
          .map_err(|e| eyre!("Failed to parse asset metadata {}: {}", path.display(), e))?;
        Ok(Some(meta))
      }
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(eyre!("Failed to read asset metadata {}: {}", path.display(), e)),
    }
  }

  /// Manifest row for `uri`, if any.
  pub fn get_manifest_entry(&self, uri: &AssetUri) -> Result<Option<ManifestEntry>> {
    let manifest = self
      .manifest
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(manifest.assets.get(&uri.to_string()).cloned())
  }

  /// Remove the content, metadata and manifest row for `uri`.
  ///
  /// Returns whether anything was removed.
  pub fn clear_asset(&self, uri: &AssetUri) -> Result<bool> {
    let mut manifest = self
      .manifest
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let dir = self.asset_dir(uri);
    let removed_files = match std::fs::remove_dir_all(&dir) {
      Ok(()) => true,
      Err(e) if e.kind() == ErrorKind::NotFound => false,
      Err(e) => return Err(eyre!("Failed to remove asset {}: {}", dir.display(), e)),
    };

    let removed_entry = manifest.assets.remove(&uri.to_string()).is_some();
    if removed_entry {
      self.persist(&manifest)?;
    }

    Ok(removed_files || removed_entry)
  }

  /// Remove every asset whose `expires_at` is before now.
  pub fn clear_expired_assets(&self) -> Result<usize> {
    self.clear_assets_expired_before(Utc::now())
  }

  /// Remove every asset whose `expires_at` is before `cutoff`.
  pub fn clear_assets_expired_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
    let expired: Vec<String> = self
      .list_assets()?
      .into_iter()
      .filter(|(_, entry)| entry.expires_at < cutoff)
      .map(|(uri, _)| uri)
      .collect();

    let mut removed = 0;
    for raw in expired {
      match AssetUri::parse(&raw) {
        Ok(uri) => {
          if self.clear_asset(&uri)? {
            removed += 1;
          }
        }
        Err(e) => {
          warn!(uri = %raw, error = %e, "dropping manifest entry with unparseable uri");
          self.remove_manifest_entry(&raw)?;
          removed += 1;
        }
      }
    }
    Ok(removed)
  }

  /// Remove a manifest row without touching files.
  pub fn remove_manifest_entry(&self, raw_uri: &str) -> Result<bool> {
    let mut manifest = self
      .manifest
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let removed = manifest.assets.remove(raw_uri).is_some();
    if removed {
      self.persist(&manifest)?;
    }
    Ok(removed)
  }

  /// Snapshot of all manifest rows, keyed by canonical URI.
  pub fn list_assets(&self) -> Result<Vec<(String, ManifestEntry)>> {
    let manifest = self
      .manifest
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      manifest
        .assets
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }

  /// Snapshot of the whole manifest.
  pub fn manifest(&self) -> Result<Manifest> {
    let manifest = self
      .manifest
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(manifest.clone())
  }

  pub fn device_id(&self) -> Result<Option<String>> {
    Ok(self.manifest()?.device_id)
  }

  pub fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
    self.update_manifest(|m| m.last_sync = Some(at))
  }

  pub fn set_license(&self, license: Option<serde_json::Value>) -> Result<()> {
    self.update_manifest(|m| m.license = license)
  }

  pub fn set_device_id(&self, device_id: &str) -> Result<()> {
    self.update_manifest(|m| m.device_id = Some(device_id.to_string()))
  }

  pub fn stats(&self) -> Result<CacheStats> {
    let manifest = self
      .manifest
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(CacheStats {
      asset_count: manifest.assets.len(),
      total_bytes: manifest.assets.values().map(|e| e.size_bytes).sum(),
    })
  }

  /// Delete every cached asset and start a fresh manifest. The device id
  /// survives the reset.
  pub fn reset(&self) -> Result<()> {
    let mut manifest = self
      .manifest
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    for kind in AssetKind::ALL {
      let dir = self.root.join(kind.dir_name());
      match std::fs::remove_dir_all(&dir) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(eyre!("Failed to remove {}: {}", dir.display(), e)),
      }
      std::fs::create_dir_all(&dir)
        .map_err(|e| eyre!("Failed to create cache directory {}: {}", dir.display(), e))?;
    }

    *manifest = Manifest {
      device_id: manifest.device_id.take(),
      ..Manifest::default()
    };
    self.persist(&manifest)
  }

  #[cfg(test)]
  pub(crate) fn set_expires_at(&self, uri: &AssetUri, expires_at: DateTime<Utc>) {
    let mut manifest = self.manifest.lock().unwrap();
    if let Some(entry) = manifest.assets.get_mut(&uri.to_string()) {
      entry.expires_at = expires_at;
    }
  }

  fn update_manifest(&self, f: impl FnOnce(&mut Manifest)) -> Result<()> {
    let mut manifest = self
      .manifest
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    f(&mut manifest);
    self.persist(&manifest)
  }

  fn persist(&self, manifest: &Manifest) -> Result<()> {
    write_json_atomic(&self.root.join(MANIFEST_FILE), manifest)
  }
}

/// Write to a sibling temp file and rename over the target.
pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid file path {}", path.display()))?
    .to_string_lossy();
  let tmp = path.with_file_name(format!(".{}.tmp", file_name));
  std::fs::write(&tmp, bytes).map_err(|e| eyre!("Failed to write {}: {}", tmp.display(), e))?;
  std::fs::rename(&tmp, path)
    .map_err(|e| eyre!("Failed to move {} into place: {}", path.display(), e))?;
  Ok(())
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
  let bytes = serde_json::to_vec_pretty(value)
    .map_err(|e| eyre!("Failed to serialize {}: {}", path.display(), e))?;
  write_bytes_atomic(path, &bytes)
}
