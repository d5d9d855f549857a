//! Typed readers over cached assets.
//!
//! Every reader does the same thing: build the full URI, look for the file on
//! disk, fetch it when absent, parse it with the kind's format and keep the
//! parsed value in memory keyed by URI.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::fetcher::AssetFetcher;
use crate::cache::types::AssetMetadata;
use crate::uri::{AssetKind, AssetUri, UriError};

/// How one asset kind is decoded.
pub trait AssetFormat: Send + Sync + 'static {
  type Output: Clone + Send + Sync + 'static;

  const KIND: AssetKind;

  fn parse(bytes: &[u8]) -> Result<Self::Output>;
}

/// Flows are YAML documents.
pub struct FlowFormat;

impl AssetFormat for FlowFormat {
  type Output = serde_json::Value;

  const KIND: AssetKind = AssetKind::Flow;

  fn parse(bytes: &[u8]) -> Result<Self::Output> {
    serde_yaml::from_slice(bytes).map_err(|e| eyre!("Invalid flow YAML: {}", e))
  }
}

/// Playbooks are Markdown with optional YAML front matter.
pub struct PlaybookFormat;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Playbook {
  pub front_matter: Option<serde_json::Value>,
  pub body: String,
}

impl AssetFormat for PlaybookFormat {
  type Output = Playbook;

  const KIND: AssetKind = AssetKind::Playbook;

  fn parse(bytes: &[u8]) -> Result<Self::Output> {
    let text =
      std::str::from_utf8(bytes).map_err(|e| eyre!("Playbook is not valid UTF-8: {}", e))?;
    parse_markdown(text)
  }
}

fn parse_markdown(text: &str) -> Result<Playbook> {
  let rest = match text
    .strip_prefix("---\n")
    .or_else(|| text.strip_prefix("---\r\n"))
  {
    Some(rest) => rest,
    None => {
      return Ok(Playbook {
        front_matter: None,
        body: text.to_string(),
      })
    }
  };

  // Front matter ends at the next line consisting only of `---`.
  let mut offset = 0;
  for line in rest.split_inclusive('\n') {
    if line.trim_end() == "---" {
      let front = &rest[..offset];
      let body = rest[offset + line.len()..].to_string();
      let front_matter = serde_yaml::from_str(front)
        .map_err(|e| eyre!("Invalid playbook front matter: {}", e))?;
      return Ok(Playbook {
        front_matter: Some(front_matter),
        body,
      });
    }
    offset += line.len();
  }

  Err(eyre!("Playbook front matter is not terminated"))
}

/// Schemas are JSON documents.
pub struct SchemaFormat;

impl AssetFormat for SchemaFormat {
  type Output = serde_json::Value;

  const KIND: AssetKind = AssetKind::Schema;

  fn parse(bytes: &[u8]) -> Result<Self::Output> {
    serde_json::from_slice(bytes).map_err(|e| eyre!("Invalid schema JSON: {}", e))
  }
}

/// A parsed asset with the cache metadata it was loaded with.
#[derive(Debug, Clone)]
pub struct LoadedAsset<T> {
  pub uri: AssetUri,
  pub data: T,
  pub metadata: Option<AssetMetadata>,
  pub path: PathBuf,
}

pub struct AssetReader<F: AssetFormat> {
  fetcher: AssetFetcher,
  memory: Mutex<HashMap<String, Arc<LoadedAsset<F::Output>>>>,
  _format: PhantomData<F>,
}

pub type FlowReader = AssetReader<FlowFormat>;
pub type PlaybookReader = AssetReader<PlaybookFormat>;
pub type SchemaReader = AssetReader<SchemaFormat>;

impl<F: AssetFormat> AssetReader<F> {
  pub fn new(fetcher: AssetFetcher) -> Self {
    Self {
      fetcher,
      memory: Mutex::new(HashMap::new()),
      _format: PhantomData,
    }
  }

  pub fn uri(namespace: &str, id: &str, version: Option<&str>) -> AssetUri {
    AssetUri::new(F::KIND, namespace, id, version)
  }

  /// Load and parse an asset. `reload` skips the in-memory copy and re-reads
  /// the file (fetching it if it is gone). Missing or unparseable assets are
  /// `None`.
  pub async fn load(
    &self,
    namespace: &str,
    id: &str,
    version: Option<&str>,
    reload: bool,
  ) -> Result<Option<Arc<LoadedAsset<F::Output>>>, UriError> {
    self
      .load_from(&Self::uri(namespace, id, version), None, reload, true)
      .await
  }

  /// Load `uri`, optionally in `locale`. Without `fetch_missing` an asset
  /// that is not on disk is `None` and the remote is not asked.
  pub async fn load_uri(
    &self,
    uri: &AssetUri,
    locale: Option<&str>,
    reload: bool,
    fetch_missing: bool,
  ) -> Result<Option<Arc<LoadedAsset<F::Output>>>, UriError> {
    if uri.kind != F::KIND {
      warn!(uri = %uri, expected = F::KIND.as_str(), "asset kind does not match reader");
      return Ok(None);
    }
    self.load_from(uri, locale, reload, fetch_missing).await
  }

  async fn load_from(
    &self,
    uri: &AssetUri,
    locale: Option<&str>,
    reload: bool,
    fetch_missing: bool,
  ) -> Result<Option<Arc<LoadedAsset<F::Output>>>, UriError> {
    let key = match locale {
      Some(locale) => format!("{}#{}", uri, locale),
      None => uri.to_string(),
    };

    if !reload {
      if let Some(hit) = self.memory_get(&key) {
        if self.is_current(uri, &hit) {
          return Ok(Some(hit));
        }
        debug!(uri = %uri, "cached asset was rewritten, parsing again");
      }
    }

    let path = match self.local_path(uri, locale) {
      Some(path) => path,
      None if !fetch_missing => {
        debug!(uri = %uri, "asset not on disk");
        return Ok(None);
      }
      None => {
        debug!(uri = %uri, "asset not on disk, fetching");
        if self.fetcher.fetch_asset(&uri.to_string(), false).await?.is_none() {
          return Ok(None);
        }
        match self.local_path(uri, locale) {
          Some(path) => path,
          None => return Ok(None),
        }
      }
    };

    let loaded = match self.parse_file(uri, &path) {
      Ok(loaded) => Arc::new(loaded),
      Err(e) => {
        warn!(uri = %uri, path = %path.display(), error = %e, "failed to parse cached asset");
        return Ok(None);
      }
    };

    if let Ok(mut memory) = self.memory.lock() {
      memory.insert(key, Arc::clone(&loaded));
    }
    Ok(Some(loaded))
  }

  /// Drop every parsed asset held in memory.
  pub fn clear_memory(&self) {
    if let Ok(mut memory) = self.memory.lock() {
      memory.clear();
    }
  }

  /// Whether a parsed copy still matches the cache write it was read from.
  fn is_current(&self, uri: &AssetUri, loaded: &LoadedAsset<F::Output>) -> bool {
    let written = match self.fetcher.store().get_manifest_entry(uri) {
      Ok(Some(entry)) => entry.cached_at,
      _ => return true,
    };
    loaded
      .metadata
      .as_ref()
      .map_or(true, |metadata| metadata.cached_at == written)
  }

  fn memory_get(&self, key: &str) -> Option<Arc<LoadedAsset<F::Output>>> {
    self.memory.lock().ok()?.get(key).cloned()
  }

  fn local_path(&self, uri: &AssetUri, locale: Option<&str>) -> Option<PathBuf> {
    let store = self.fetcher.store();
    if let Some(locale) = locale {
      let localized = store
        .asset_dir(uri)
        .join(format!("asset.{}.{}", locale, F::KIND.extension()));
      if localized.exists() {
        return Some(localized);
      }
    }
    let path = store.get_asset_path(uri);
    path.exists().then_some(path)
  }

  fn parse_file(&self, uri: &AssetUri, path: &Path) -> Result<LoadedAsset<F::Output>> {
    let bytes =
      std::fs::read(path).map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
    let data = F::parse(&bytes)?;
    let metadata = self.fetcher.store().get_asset_metadata(uri).unwrap_or_else(|e| {
      warn!(uri = %uri, error = %e, "failed to read asset metadata");
      None
    });
    Ok(LoadedAsset {
      uri: uri.clone(),
      data,
      metadata,
      path: path.to_path_buf(),
    })
  }
}

impl AssetReader<PlaybookFormat> {
  /// Load a playbook, preferring `asset.<locale>.md` and falling back to the
  /// unlocalized `asset.md`.
  pub async fn load_localized(
    &self,
    namespace: &str,
    id: &str,
    version: Option<&str>,
    locale: Option<&str>,
    reload: bool,
  ) -> Result<Option<Arc<LoadedAsset<Playbook>>>, UriError> {
    self
      .load_from(&Self::uri(namespace, id, version), locale, reload, true)
      .await
  }
}

impl AssetReader<SchemaFormat> {
  /// Whether the cached schema satisfies `required_version`. The cached
  /// version is the document's `version` field, else the URI version.
  pub async fn is_compatible(
    &self,
    namespace: &str,
    id: &str,
    required_version: &str,
  ) -> Result<bool, UriError> {
    let loaded = match self.load(namespace, id, None, false).await? {
      Some(loaded) => loaded,
      None => return Ok(false),
    };
    let cached = loaded
      .data
      .get("version")
      .and_then(|v| v.as_str())
      .unwrap_or(&loaded.uri.version);
    Ok(versions_compatible(required_version, cached))
  }
}

/// Same major version, and the required minor must not exceed the cached one.
pub fn versions_compatible(required: &str, cached: &str) -> bool {
  match (major_minor(required), major_minor(cached)) {
    (Some((req_major, req_minor)), Some((major, minor))) => {
      req_major == major && req_minor <= minor
    }
    _ => false,
  }
}

fn major_minor(version: &str) -> Option<(u64, u64)> {
  let mut parts = version.trim().trim_start_matches('v').split('.');
  let major = parts.next()?.parse().ok()?;
  let minor = match parts.next() {
    Some(minor) => minor.parse().ok()?,
    None => 0,
  };
  Some((major, minor))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::CacheStore;
  use crate::test_support::{assets_response, remote_asset, ScriptedApi};
  use serde_json::json;
  use tempfile::TempDir;

  fn setup() -> (TempDir, Arc<ScriptedApi>, AssetFetcher) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(dir.path()).unwrap());
    let api = Arc::new(ScriptedApi::default());
    let fetcher = AssetFetcher::new(store, api.clone());
    (dir, api, fetcher)
  }

  #[tokio::test]
  async fn test_flow_reader_fetches_and_memoizes() {
    let (_dir, api, fetcher) = setup();
    api.push_fetch(Ok(assets_response(vec![remote_asset(
      "asset://flow/acme/intake@1",
      b"name: intake\nsteps:\n  - triage\n",
    )])));
    let reader = FlowReader::new(fetcher.clone());

    let flow = reader.load("acme", "intake", Some("1"), false).await.unwrap().unwrap();
    assert_eq!(flow.data["steps"], json!(["triage"]));
    assert!(flow.metadata.is_some());

    // Overwrite the file behind the reader's back: memory wins until reload.
    std::fs::write(&flow.path, "name: changed\n").unwrap();
    let again = reader.load("acme", "intake", Some("1"), false).await.unwrap().unwrap();
    assert_eq!(again.data["name"], "intake");
    let reloaded = reader.load("acme", "intake", Some("1"), true).await.unwrap().unwrap();
    assert_eq!(reloaded.data["name"], "changed");
    assert_eq!(api.fetch_count(), 1);

    // A new cache write (a refresh) invalidates the parsed copy.
    let uri = AssetUri::parse("asset://flow/acme/intake@1").unwrap();
    fetcher.store().store_asset(&uri, b"name: refreshed\n", None, None).unwrap();
    let refreshed = reader.load("acme", "intake", Some("1"), false).await.unwrap().unwrap();
    assert_eq!(refreshed.data["name"], "refreshed");
  }

  #[tokio::test]
  async fn test_missing_asset_is_none() {
    let (_dir, _api, fetcher) = setup();
    let reader = SchemaReader::new(fetcher);
    assert!(reader.load("acme", "nope", None, false).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_load_uri_without_fetch_stays_local() {
    let (_dir, api, fetcher) = setup();
    let reader = SchemaReader::new(fetcher);
    let uri = AssetUri::parse("asset://schema/acme/ticket@1").unwrap();
    assert!(reader.load_uri(&uri, None, false, false).await.unwrap().is_none());
    assert_eq!(api.fetch_count(), 0);

    let flow = AssetUri::parse("asset://flow/acme/intake@1").unwrap();
    assert!(reader.load_uri(&flow, None, false, true).await.unwrap().is_none());
    assert_eq!(api.fetch_count(), 0);
  }

  #[tokio::test]
  async fn test_unparseable_asset_is_none() {
    let (_dir, api, fetcher) = setup();
    api.push_fetch(Ok(assets_response(vec![remote_asset(
      "asset://schema/acme/broken@1",
      b"{not json",
    )])));
    let reader = SchemaReader::new(fetcher);
    assert!(reader.load("acme", "broken", Some("1"), false).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_playbook_locale_fallback() {
    let (_dir, api, fetcher) = setup();
    let uri = "asset://playbook/acme/escalation@2";
    api.push_fetch(Ok(assets_response(vec![remote_asset(
      uri,
      b"---\ntitle: Escalation\n---\n# Steps\n",
    )])));
    let reader = PlaybookReader::new(fetcher.clone());

    let base = reader
      .load_localized("acme", "escalation", Some("2"), Some("de"), false)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(base.data.body, "# Steps\n");
    assert_eq!(
      base.data.front_matter.as_ref().unwrap()["title"],
      "Escalation"
    );

    let parsed = AssetUri::parse(uri).unwrap();
    std::fs::write(
      fetcher.store().asset_dir(&parsed).join("asset.fr.md"),
      "# Etapes\n",
    )
    .unwrap();
    let fr = reader
      .load_localized("acme", "escalation", Some("2"), Some("fr"), false)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(fr.data.body, "# Etapes\n");
    assert!(fr.data.front_matter.is_none());
  }

  #[test]
  fn test_markdown_front_matter() {
    let parsed = parse_markdown("no front matter").unwrap();
    assert!(parsed.front_matter.is_none());
    assert!(parse_markdown("---\ntitle: x\nbody without end").is_err());
  }

  #[test]
  fn test_schema_version_compatibility() {
    assert!(versions_compatible("2.1", "2.3"));
    assert!(versions_compatible("2.3", "2.3.7"));
    assert!(versions_compatible("v1", "1.0"));
    assert!(!versions_compatible("2.4", "2.3"));
    assert!(!versions_compatible("1.0", "2.0"));
    assert!(!versions_compatible("2.0", "latest"));
  }

  #[tokio::test]
  async fn test_schema_is_compatible_reads_document_version() {
    let (_dir, api, fetcher) = setup();
    api.push_fetch(Ok(assets_response(vec![remote_asset(
      "asset://schema/acme/ticket",
      br#"{"version": "3.2", "type": "object"}"#,
    )])));
    let reader = SchemaReader::new(fetcher);
    assert!(reader.is_compatible("acme", "ticket", "3.1").await.unwrap());
    assert!(!reader.is_compatible("acme", "ticket", "3.3").await.unwrap());
  }
}
