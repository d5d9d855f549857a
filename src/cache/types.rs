//! Core types shared by the cache store, lifecycle manager and facade.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::uri::AssetKind;

/// Lifecycle classification of a cached asset.
///
/// Computed from `expires_at` and the current time; the value persisted in
/// the manifest is only the classification at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLifecycle {
  /// Within TTL.
  Valid,
  /// Past TTL but inside the stale-while-revalidate window: serve, then refresh.
  Stale,
  /// Past the grace window: must refetch, may still be served as a last resort.
  Expired,
  /// No metadata for this URI.
  Invalid,
}

impl CacheLifecycle {
  /// Whether the cached copy may be served without contacting the remote first.
  pub fn is_servable(&self) -> bool {
    matches!(self, Self::Valid | Self::Stale)
  }
}

impl fmt::Display for CacheLifecycle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Valid => "valid",
      Self::Stale => "stale",
      Self::Expired => "expired",
      Self::Invalid => "invalid",
    };
    f.write_str(s)
  }
}

/// Metadata written next to every cached asset (`metadata.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
  pub uri: String,
  pub kind: AssetKind,
  pub path: PathBuf,
  pub checksum: String,
  pub content_type: String,
  pub size_bytes: u64,
  pub cached_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  pub status: CacheLifecycle,
  /// Free-form metadata supplied by the remote with the asset.
  #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Bytes or a parsed asset, tagged with where it was read from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the served copy was written to the cache. `None` for network reads.
  pub cached_at: Option<DateTime<Utc>>,
  /// A refresh of this asset was queued (or deferred until reconnect) while
  /// the cached copy was served.
  pub refresh_scheduled: bool,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      refresh_scheduled: false,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
      refresh_scheduled: false,
    }
  }

  /// Cached data served because the remote could not be used.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
      refresh_scheduled: false,
    }
  }

  pub fn with_refresh_scheduled(mut self, scheduled: bool) -> Self {
    self.refresh_scheduled = scheduled;
    self
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from the remote by this read
  Network,
  /// VALID cache hit
  CacheFresh,
  /// STALE cache hit, served while a refresh is pending
  CacheStale,
  /// EXPIRED copy, or any copy read while offline or after a failed fetch
  Offline,
}
