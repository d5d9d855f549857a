//! Serde types matching the remote sync API request and response bodies.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Version check: POST /api/v1/sync/versions/check
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AssetVersionRef {
  pub uri: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionCheckRequest {
  pub client_version: String,
  pub capabilities: Vec<String>,
  pub assets: Vec<AssetVersionRef>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub license_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub device_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetUpdate {
  pub uri: String,
  #[serde(default)]
  pub latest_version: Option<String>,
  #[serde(default)]
  pub checksum: Option<String>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionCheckResponse {
  #[serde(default)]
  pub client_update: Option<serde_json::Value>,
  #[serde(default)]
  pub capability_updates: Vec<serde_json::Value>,
  #[serde(default)]
  pub asset_updates: Vec<AssetUpdate>,
  #[serde(default)]
  pub license: Option<serde_json::Value>,
  #[serde(default)]
  pub server_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Asset fetch: POST /api/v1/sync/assets/fetch
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AssetRef {
  pub uri: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BaseVersion {
  pub uri: String,
  pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncrementalRequest {
  pub enabled: bool,
  pub base_versions: Vec<BaseVersion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchAssetsRequest {
  pub assets: Vec<AssetRef>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub incremental: Option<IncrementalRequest>,
}

impl FetchAssetsRequest {
  pub fn full<'a>(uris: impl IntoIterator<Item = &'a str>) -> Self {
    Self {
      assets: uris
        .into_iter()
        .map(|uri| AssetRef {
          uri: uri.to_string(),
        })
        .collect(),
      incremental: None,
    }
  }

  pub fn incremental(uri: &str, base_version: &str) -> Self {
    Self {
      assets: vec![AssetRef {
        uri: uri.to_string(),
      }],
      incremental: Some(IncrementalRequest {
        enabled: true,
        base_versions: vec![BaseVersion {
          uri: uri.to_string(),
          version: base_version.to_string(),
        }],
      }),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAsset {
  pub uri: String,
  #[serde(default)]
  pub content_type: Option<String>,
  /// Base64 payload, or a `data:` URI.
  pub content: String,
  #[serde(default)]
  pub checksum: Option<String>,
  #[serde(default)]
  pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl RemoteAsset {
  /// Decode the transported content into raw bytes.
  pub fn decode_content(&self) -> Result<Vec<u8>, String> {
    decode_content(&self.content)
  }
}

/// Decode either a bare base64 string or a `data:[mime][;base64],payload` URI.
pub fn decode_content(content: &str) -> Result<Vec<u8>, String> {
  if let Some(rest) = content.strip_prefix("data:") {
    let (header, payload) = rest
      .split_once(',')
      .ok_or_else(|| "data uri without ',' separator".to_string())?;
    if header.split(';').any(|part| part == "base64") {
      return BASE64
        .decode(payload.trim())
        .map_err(|e| format!("invalid base64 in data uri: {}", e));
    }
    return Ok(payload.as_bytes().to_vec());
  }

  BASE64
    .decode(content.trim())
    .map_err(|e| format!("invalid base64 content: {}", e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
  FullReplace,
  JsonPatch,
  TextDiff,
  #[serde(other)]
  Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetDiff {
  pub uri: String,
  pub diff_type: DiffType,
  #[serde(default)]
  pub diff: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchAssetsResponse {
  #[serde(default)]
  pub assets: Vec<RemoteAsset>,
  #[serde(default)]
  pub diffs: Vec<AssetDiff>,
}

// ============================================================================
// Instance sync: POST /api/v1/sync/instances/sync
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
  Pull,
  Push,
  Merge,
}

impl std::str::FromStr for SyncDirection {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "pull" => Ok(Self::Pull),
      "push" => Ok(Self::Push),
      "merge" => Ok(Self::Merge),
      other => Err(format!("unknown sync direction '{}'", other)),
    }
  }
}

impl std::fmt::Display for SyncDirection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Pull => "pull",
      Self::Push => "push",
      Self::Merge => "merge",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceRef {
  pub id: String,
  #[serde(rename = "type")]
  pub instance_type: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub local_data: Option<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub local_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSyncRequest {
  pub direction: SyncDirection,
  pub instances: Vec<InstanceRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteSyncStatus {
  Synced,
  Merged,
  Conflict,
  #[serde(other)]
  Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSyncResult {
  pub status: RemoteSyncStatus,
  #[serde(default)]
  pub cloud_data: Option<serde_json::Value>,
  #[serde(default)]
  pub cloud_version: Option<u64>,
  #[serde(default)]
  pub conflict: Option<serde_json::Value>,
  #[serde(default)]
  pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceSyncResponse {
  #[serde(default)]
  pub results: Vec<InstanceSyncResult>,
}
