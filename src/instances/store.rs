//! Filesystem store for editable instances and their local change logs.
//!
//! Layout under the instances root:
//!
//! ```text
//! {instance_type}/{instance_id}/data.json
//! {instance_type}/{instance_id}/metadata.json
//! {instance_type}/{instance_id}/local_changes/change_{change_id}.json
//! ```

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::types::{Instance, InstanceMetadata, LocalChange};
use crate::cache::storage::write_json_atomic;

const DATA_FILE: &str = "data.json";
const METADATA_FILE: &str = "metadata.json";
const CHANGES_DIR: &str = "local_changes";

pub struct InstanceStore {
  root: PathBuf,
}

impl InstanceStore {
  pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
    let root = root.into();
    std::fs::create_dir_all(&root)
      .map_err(|e| eyre!("Failed to create instances directory {}: {}", root.display(), e))?;
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn instance_dir(&self, instance_type: &str, instance_id: &str) -> Result<PathBuf> {
    check_segment(instance_type)?;
    check_segment(instance_id)?;
    Ok(self.root.join(instance_type).join(instance_id))
  }

  pub fn exists(&self, instance_type: &str, instance_id: &str) -> Result<bool> {
    Ok(
      self
        .instance_dir(instance_type, instance_id)?
        .join(METADATA_FILE)
        .exists(),
    )
  }

  /// Create a new instance. Fails if it already exists. A fresh instance has
  /// never been synced, so it starts with local changes.
  pub fn create_instance(
    &self,
    instance_type: &str,
    instance_id: &str,
    data: &serde_json::Value,
  ) -> Result<InstanceMetadata> {
    if self.exists(instance_type, instance_id)? {
      return Err(eyre!(
        "Instance {}/{} already exists",
        instance_type,
        instance_id
      ));
    }
    let now = Utc::now();
    let metadata = InstanceMetadata {
      instance_id: instance_id.to_string(),
      instance_type: instance_type.to_string(),
      local_version: 1,
      cloud_version: 0,
      has_local_changes: true,
      created_at: now,
      updated_at: now,
      last_sync: None,
    };
    self.write_instance(&metadata, Some(data))?;
    info!(instance = %metadata.key(), "created instance");
    Ok(metadata)
  }

  pub fn get_instance(&self, instance_type: &str, instance_id: &str) -> Result<Option<Instance>> {
    let dir = self.instance_dir(instance_type, instance_id)?;
    let Some(metadata) = read_json::<InstanceMetadata>(&dir.join(METADATA_FILE))? else {
      return Ok(None);
    };
    let data = read_json(&dir.join(DATA_FILE))?.unwrap_or(serde_json::Value::Null);
    Ok(Some(Instance { metadata, data }))
  }

  pub fn get_metadata(
    &self,
    instance_type: &str,
    instance_id: &str,
  ) -> Result<Option<InstanceMetadata>> {
    read_json(&self.instance_dir(instance_type, instance_id)?.join(METADATA_FILE))
  }

  /// Replace an instance's content.
  ///
  /// With `track_changes` a differing write appends a [`LocalChange`] and
  /// bumps `local_version`; an identical write changes nothing. Without it
  /// the content is overwritten silently and the versions are left alone
  /// (used when writing remote-authoritative data).
  pub fn update_instance(
    &self,
    instance_type: &str,
    instance_id: &str,
    data: &serde_json::Value,
    track_changes: bool,
  ) -> Result<InstanceMetadata> {
    let Some(current) = self.get_instance(instance_type, instance_id)? else {
      return Err(eyre!(
        "Instance {}/{} does not exist",
        instance_type,
        instance_id
      ));
    };
    let mut metadata = current.metadata;

    if track_changes {
      if current.data == *data {
        debug!(instance = %metadata.key(), "update is a no-op");
        return Ok(metadata);
      }
      metadata.local_version += 1;
      metadata.has_local_changes = true;
      self.append_change(&metadata, Some(current.data), Some(data.clone()))?;
    }

    metadata.updated_at = Utc::now();
    self.write_instance(&metadata, Some(data))?;
    Ok(metadata)
  }

  /// Delete an instance together with its change log.
  pub fn delete_instance(&self, instance_type: &str, instance_id: &str) -> Result<bool> {
    let dir = self.instance_dir(instance_type, instance_id)?;
    match std::fs::remove_dir_all(&dir) {
      Ok(()) => {
        info!(instance = %format!("{}/{}", instance_type, instance_id), "deleted instance");
        Ok(true)
      }
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
      Err(e) => Err(eyre!("Failed to delete instance {}: {}", dir.display(), e)),
    }
  }

  /// Metadata of every instance, optionally of one type, ordered by type
  /// then id.
  pub fn list_instances(&self, instance_type: Option<&str>) -> Result<Vec<InstanceMetadata>> {
    let types = match instance_type {
      Some(t) => vec![t.to_string()],
      None => self.list_instance_types()?,
    };

    let mut out = Vec::new();
    for t in types {
      check_segment(&t)?;
      for id in list_dirs(&self.root.join(&t))? {
        if let Some(metadata) = self.get_metadata(&t, &id)? {
          out.push(metadata);
        }
      }
    }
    Ok(out)
  }

  pub fn list_instance_types(&self) -> Result<Vec<String>> {
    list_dirs(&self.root)
  }

  /// The whole change log, oldest first.
  pub fn get_local_changes(
    &self,
    instance_type: &str,
    instance_id: &str,
  ) -> Result<Vec<LocalChange>> {
    let dir = self
      .instance_dir(instance_type, instance_id)?
      .join(CHANGES_DIR);
    let entries = match std::fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(eyre!("Failed to list changes in {}: {}", dir.display(), e)),
    };

    let mut changes = Vec::new();
    for entry in entries {
      let path = entry
        .map_err(|e| eyre!("Failed to list changes in {}: {}", dir.display(), e))?
        .path();
      if path.extension().and_then(|e| e.to_str()) != Some("json") {
        continue;
      }
      if let Some(change) = read_json::<LocalChange>(&path)? {
        changes.push(change);
      }
    }
    changes.sort_by(|a, b| {
      a.version
        .cmp(&b.version)
        .then(a.created_at.cmp(&b.created_at))
    });
    Ok(changes)
  }

  /// Changes not yet marked synced, oldest first.
  pub fn get_pending_changes(
    &self,
    instance_type: &str,
    instance_id: &str,
  ) -> Result<Vec<LocalChange>> {
    Ok(
      self
        .get_local_changes(instance_type, instance_id)?
        .into_iter()
        .filter(|c| !c.synced)
        .collect(),
    )
  }

  pub fn mark_change_synced(
    &self,
    instance_type: &str,
    instance_id: &str,
    change_id: &str,
  ) -> Result<bool> {
    check_segment(change_id)?;
    let path = self.change_path(instance_type, instance_id, change_id)?;
    let Some(mut change) = read_json::<LocalChange>(&path)? else {
      return Ok(false);
    };
    if change.synced {
      return Ok(false);
    }
    change.synced = true;
    change.synced_at = Some(Utc::now());
    write_json_atomic(&path, &change)?;
    Ok(true)
  }

  /// Mark every pending change synced. Returns how many changed state.
  pub fn mark_all_changes_synced(&self, instance_type: &str, instance_id: &str) -> Result<usize> {
    let mut marked = 0;
    for change in self.get_pending_changes(instance_type, instance_id)? {
      if self.mark_change_synced(instance_type, instance_id, &change.change_id)? {
        marked += 1;
      }
    }
    Ok(marked)
  }

  /// Delete change records already marked synced.
  pub fn clear_synced_changes(&self, instance_type: &str, instance_id: &str) -> Result<usize> {
    self.remove_changes(instance_type, instance_id, |c| c.synced)
  }

  /// Delete the whole change log, synced or not.
  pub fn clear_local_changes(&self, instance_type: &str, instance_id: &str) -> Result<usize> {
    self.remove_changes(instance_type, instance_id, |_| true)
  }

  /// Record that the instance now matches remote version `cloud_version`.
  ///
  /// `content` (remote-authoritative) is written untracked; an instance that
  /// does not exist locally yet is created from it. Both versions are set to
  /// `cloud_version` and pending changes are marked synced.
  pub fn record_sync(
    &self,
    instance_type: &str,
    instance_id: &str,
    cloud_version: u64,
    content: Option<&serde_json::Value>,
  ) -> Result<InstanceMetadata> {
    let now = Utc::now();
    let mut metadata = match self.get_metadata(instance_type, instance_id)? {
      Some(metadata) => metadata,
      None if content.is_some() => InstanceMetadata {
        instance_id: instance_id.to_string(),
        instance_type: instance_type.to_string(),
        local_version: 0,
        cloud_version: 0,
        has_local_changes: false,
        created_at: now,
        updated_at: now,
        last_sync: None,
      },
      None => {
        return Err(eyre!(
          "Instance {}/{} does not exist",
          instance_type,
          instance_id
        ))
      }
    };

    metadata.local_version = cloud_version;
    metadata.cloud_version = cloud_version;
    metadata.has_local_changes = false;
    metadata.last_sync = Some(now);
    if content.is_some() {
      metadata.updated_at = now;
    }
    self.write_instance(&metadata, content)?;
    self.mark_all_changes_synced(instance_type, instance_id)?;
    debug!(instance = %metadata.key(), cloud_version, "recorded sync");
    Ok(metadata)
  }

  /// Remember the remote's version without touching content, e.g. after a
  /// conflict report.
  pub fn set_cloud_version(
    &self,
    instance_type: &str,
    instance_id: &str,
    cloud_version: u64,
  ) -> Result<Option<InstanceMetadata>> {
    let Some(mut metadata) = self.get_metadata(instance_type, instance_id)? else {
      return Ok(None);
    };
    metadata.cloud_version = cloud_version;
    metadata.has_local_changes = metadata.has_local_changes || metadata.local_version != cloud_version;
    self.save_metadata(&metadata)?;
    Ok(Some(metadata))
  }

  /// Overwrite an instance's metadata file.
  pub fn save_metadata(&self, metadata: &InstanceMetadata) -> Result<()> {
    self.write_instance(metadata, None)
  }

  pub fn touch_last_sync(
    &self,
    instance_type: &str,
    instance_id: &str,
    at: DateTime<Utc>,
  ) -> Result<()> {
    if let Some(mut metadata) = self.get_metadata(instance_type, instance_id)? {
      metadata.last_sync = Some(at);
      self.save_metadata(&metadata)?;
    }
    Ok(())
  }

  fn write_instance(
    &self,
    metadata: &InstanceMetadata,
    data: Option<&serde_json::Value>,
  ) -> Result<()> {
    let dir = self.instance_dir(&metadata.instance_type, &metadata.instance_id)?;
    std::fs::create_dir_all(&dir)
      .map_err(|e| eyre!("Failed to create instance directory {}: {}", dir.display(), e))?;
    if let Some(data) = data {
      write_json_atomic(&dir.join(DATA_FILE), data)?;
    }
    write_json_atomic(&dir.join(METADATA_FILE), metadata)
  }

  fn change_path(&self, instance_type: &str, instance_id: &str, change_id: &str) -> Result<PathBuf> {
    Ok(
      self
        .instance_dir(instance_type, instance_id)?
        .join(CHANGES_DIR)
        .join(format!("change_{}.json", change_id)),
    )
  }

  fn append_change(
    &self,
    metadata: &InstanceMetadata,
    before: Option<serde_json::Value>,
    after: Option<serde_json::Value>,
  ) -> Result<LocalChange> {
    let change = LocalChange {
      change_id: uuid::Uuid::new_v4().simple().to_string(),
      instance_id: metadata.instance_id.clone(),
      instance_type: metadata.instance_type.clone(),
      version: metadata.local_version,
      created_at: Utc::now(),
      before,
      after,
      synced: false,
      synced_at: None,
    };
    let path = self.change_path(&metadata.instance_type, &metadata.instance_id, &change.change_id)?;
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create change log {}: {}", parent.display(), e))?;
    }
    write_json_atomic(&path, &change)?;
    debug!(
      instance = %metadata.key(),
      change_id = %change.change_id,
      version = change.version,
      "tracked local change"
    );
    Ok(change)
  }

  fn remove_changes(
    &self,
    instance_type: &str,
    instance_id: &str,
    predicate: impl Fn(&LocalChange) -> bool,
  ) -> Result<usize> {
    let mut removed = 0;
    for change in self.get_local_changes(instance_type, instance_id)? {
      if !predicate(&change) {
        continue;
      }
      let path = self.change_path(instance_type, instance_id, &change.change_id)?;
      match std::fs::remove_file(&path) {
        Ok(()) => removed += 1,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(eyre!("Failed to remove {}: {}", path.display(), e)),
      }
    }
    Ok(removed)
  }
}

/// Instance types, ids and change ids become path segments.
fn check_segment(segment: &str) -> Result<()> {
  if segment.is_empty()
    || segment == "."
    || segment == ".."
    || segment.contains(['/', '\\'])
  {
    return Err(eyre!("Invalid instance path segment '{}'", segment));
  }
  Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
  match std::fs::read(path) {
    Ok(bytes) => serde_json::from_slice(&bytes)
      .map(Some)
      .map_err(|e| eyre!("Failed to parse {}: {}", path.display(), e)),
    Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
    Err(e) => Err(eyre!("Failed to read {}: {}", path.display(), e)),
  }
}

fn list_dirs(dir: &Path) -> Result<Vec<String>> {
  let entries = match std::fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(eyre!("Failed to list {}: {}", dir.display(), e)),
  };
  let mut names = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|e| eyre!("Failed to list {}: {}", dir.display(), e))?;
    if entry.path().is_dir() {
      if let Some(name) = entry.file_name().to_str() {
        if !name.starts_with('.') {
          names.push(name.to_string());
        }
      }
    }
  }
  names.sort();
  Ok(names)
}
