use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stored alongside each instance's data as `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
  pub instance_id: String,
  pub instance_type: String,
  /// Incremented on every tracked local edit
  pub local_version: u64,
  /// Last version known to match the remote
  pub cloud_version: u64,
  pub has_local_changes: bool,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub last_sync: Option<DateTime<Utc>>,
}

impl InstanceMetadata {
  pub fn key(&self) -> String {
    instance_key(&self.instance_type, &self.instance_id)
  }

  pub fn in_sync(&self) -> bool {
    self.local_version == self.cloud_version && !self.has_local_changes
  }
}

pub fn instance_key(instance_type: &str, instance_id: &str) -> String {
  format!("{}/{}", instance_type, instance_id)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instance {
  pub metadata: InstanceMetadata,
  pub data: serde_json::Value,
}

/// One tracked local edit. Entries are marked synced rather than deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalChange {
  pub change_id: String,
  pub instance_id: String,
  pub instance_type: String,
  /// Local version produced by this edit; orders the log
  pub version: u64,
  pub created_at: DateTime<Utc>,
  pub before: Option<serde_json::Value>,
  pub after: Option<serde_json::Value>,
  #[serde(default)]
  pub synced: bool,
  #[serde(default)]
  pub synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatus {
  Synced,
  Conflict,
  Merged,
  Failed,
}

impl SyncStatus {
  pub fn is_success(&self) -> bool {
    matches!(self, Self::Synced | Self::Merged)
  }
}

impl fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Synced => "SYNCED",
      Self::Conflict => "CONFLICT",
      Self::Merged => "MERGED",
      Self::Failed => "FAILED",
    };
    f.write_str(s)
  }
}

/// Result of one sync call. Never an error: failures are a `Failed` status
/// carrying the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
  pub status: SyncStatus,
  pub cloud_version: Option<u64>,
  /// Conflict payload, including `resolution_options`
  pub conflict: Option<serde_json::Value>,
  pub error: Option<String>,
  pub message: Option<String>,
  /// Set when the call failed on the network and was queued for retry
  pub queued: bool,
}

impl SyncOutcome {
  pub fn synced(cloud_version: Option<u64>) -> Self {
    Self {
      status: SyncStatus::Synced,
      cloud_version,
      conflict: None,
      error: None,
      message: None,
      queued: false,
    }
  }

  pub fn merged(cloud_version: Option<u64>) -> Self {
    Self {
      status: SyncStatus::Merged,
      ..Self::synced(cloud_version)
    }
  }

  pub fn conflict(cloud_version: Option<u64>, payload: serde_json::Value) -> Self {
    Self {
      status: SyncStatus::Conflict,
      conflict: Some(payload),
      ..Self::synced(cloud_version)
    }
  }

  pub fn failed(error: impl Into<String>) -> Self {
    Self {
      status: SyncStatus::Failed,
      error: Some(error.into()),
      ..Self::synced(None)
    }
  }

  pub fn with_message(mut self, message: impl Into<String>) -> Self {
    self.message = Some(message.into());
    self
  }
}

/// How to settle a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
  /// Keep local content; the next push overwrites the remote.
  UseLocal,
  /// Accept the remote version and drop local pending changes.
  UseCloud,
  /// Caller-supplied merged content. No field-level merging is done here.
  ManualMerge(serde_json::Value),
}

impl ConflictResolution {
  pub const OPTIONS: [&'static str; 3] = ["use_local", "use_cloud", "manual_merge"];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::UseLocal => "use_local",
      Self::UseCloud => "use_cloud",
      Self::ManualMerge(_) => "manual_merge",
    }
  }
}

/// Parses the hints that need no payload. `manual_merge` is rejected: it
/// needs merged content.
impl FromStr for ConflictResolution {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().replace('-', "_").as_str() {
      "use_local" | "local" => Ok(Self::UseLocal),
      "use_cloud" | "cloud" => Ok(Self::UseCloud),
      "manual_merge" => Err("manual_merge needs merged content".to_string()),
      other => Err(format!("unknown conflict resolution '{}'", other)),
    }
  }
}

/// What a UI needs to present a conflict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictInfo {
  pub instance_id: String,
  pub instance_type: String,
  pub local_version: u64,
  pub cloud_version: u64,
  pub local_data: Option<serde_json::Value>,
  pub pending_changes: usize,
  pub resolution_options: Vec<String>,
}
