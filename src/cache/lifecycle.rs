//! TTL classification of cached assets.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};

use super::storage::CacheStore;
use super::types::CacheLifecycle;
use crate::uri::AssetUri;

/// Grace period after `expires_at` during which an asset is served stale
/// while a refresh is attempted. Uniform across asset kinds.
pub fn stale_while_revalidate() -> Duration {
  Duration::hours(1)
}

/// Classify an expiry timestamp against `now`.
pub fn classify(
  expires_at: Option<DateTime<Utc>>,
  now: DateTime<Utc>,
  stale_window: Duration,
) -> CacheLifecycle {
  match expires_at {
    None => CacheLifecycle::Invalid,
    Some(expires_at) if now <= expires_at => CacheLifecycle::Valid,
    Some(expires_at) if now <= expires_at + stale_window => CacheLifecycle::Stale,
    Some(_) => CacheLifecycle::Expired,
  }
}

/// Outcome of an expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
  /// Manifest entries examined
  pub checked: usize,
  /// EXPIRED entries deleted
  pub removed: usize,
  /// STALE entries left in place
  pub retained_stale: usize,
  /// Rows dropped because the content file vanished or the URI is unparseable
  pub pruned_invalid: usize,
  /// Entries that could not be removed
  pub errors: usize,
}

/// Read-only lifecycle queries over a [`CacheStore`], plus the expiry sweep.
#[derive(Clone)]
pub struct LifecycleManager {
  store: Arc<CacheStore>,
  stale_window: Duration,
}

impl LifecycleManager {
  pub fn new(store: Arc<CacheStore>) -> Self {
    Self {
      store,
      stale_window: stale_while_revalidate(),
    }
  }

  pub fn with_stale_window(mut self, stale_window: Duration) -> Self {
    self.stale_window = stale_window;
    self
  }

  pub fn get_asset_status(&self, uri: &AssetUri) -> CacheLifecycle {
    self.status_at(uri, Utc::now())
  }

  /// Status of `uri` as of `now`. A manifest row whose content file is gone
  /// counts as INVALID.
  pub fn status_at(&self, uri: &AssetUri, now: DateTime<Utc>) -> CacheLifecycle {
    let entry = match self.store.get_manifest_entry(uri) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(uri = %uri, error = %e, "failed to read manifest entry");
        None
      }
    };
    match entry {
      Some(entry) if entry.path.exists() => classify(Some(entry.expires_at), now, self.stale_window),
      _ => CacheLifecycle::Invalid,
    }
  }

  pub fn is_asset_valid(&self, uri: &AssetUri) -> bool {
    self.get_asset_status(uri) == CacheLifecycle::Valid
  }

  pub fn cleanup_expired(&self) -> Result<CleanupStats> {
    self.cleanup_expired_at(Utc::now())
  }

  /// Remove EXPIRED assets and prune manifest rows whose files vanished.
  /// STALE assets are kept: they are still servable.
  pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Result<CleanupStats> {
    let mut stats = CleanupStats::default();

    for (raw, entry) in self.store.list_assets()? {
      stats.checked += 1;

      let uri = match AssetUri::parse(&raw) {
        Ok(uri) => uri,
        Err(e) => {
          warn!(uri = %raw, error = %e, "pruning manifest entry with unparseable uri");
          self.store.remove_manifest_entry(&raw)?;
          stats.pruned_invalid += 1;
          continue;
        }
      };

      if !entry.path.exists() {
        self.store.remove_manifest_entry(&raw)?;
        stats.pruned_invalid += 1;
        continue;
      }

      match classify(Some(entry.expires_at), now, self.stale_window) {
        CacheLifecycle::Expired => match self.store.clear_asset(&uri) {
          Ok(_) => stats.removed += 1,
          Err(e) => {
            warn!(uri = %uri, error = %e, "failed to remove expired asset");
            stats.errors += 1;
          }
        },
        CacheLifecycle::Stale => stats.retained_stale += 1,
        CacheLifecycle::Valid | CacheLifecycle::Invalid => {}
      }
    }

    if stats.removed > 0 || stats.pruned_invalid > 0 {
      info!(
        removed = stats.removed,
        pruned = stats.pruned_invalid,
        "expired asset sweep finished"
      );
    }
    Ok(stats)
  }
}
