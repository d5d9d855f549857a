//! Asset URIs of the form `scheme://{kind}/{namespace}/{id}@{version}`.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version used when a URI carries no `@version` suffix.
pub const LATEST: &str = "latest";

/// Scheme used when building URIs from parts.
pub const DEFAULT_SCHEME: &str = "asset";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UriError {
  #[error("asset uri is empty")]
  Empty,
  #[error("asset uri '{0}' must have at least kind/namespace/id segments")]
  MissingSegments(String),
  #[error("asset uri '{uri}' has unknown kind '{kind}'")]
  UnknownKind { uri: String, kind: String },
  #[error("asset uri '{0}' has an empty version")]
  EmptyVersion(String),
  #[error("asset uri '{0}' contains an invalid path segment")]
  InvalidSegment(String),
}

/// Kind of remotely-authored asset. Determines the cache directory, file
/// extension, content type and TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
  Capability,
  Flow,
  Playbook,
  Schema,
  Prompt,
  License,
}

impl AssetKind {
  pub const ALL: [AssetKind; 6] = [
    AssetKind::Capability,
    AssetKind::Flow,
    AssetKind::Playbook,
    AssetKind::Schema,
    AssetKind::Prompt,
    AssetKind::License,
  ];

  /// Accepts both the singular (`flow`) and directory (`flows`) spelling.
  pub fn from_segment(segment: &str) -> Option<Self> {
    match segment.to_ascii_lowercase().as_str() {
      "capability" | "capabilities" => Some(Self::Capability),
      "flow" | "flows" => Some(Self::Flow),
      "playbook" | "playbooks" => Some(Self::Playbook),
      "schema" | "schemas" => Some(Self::Schema),
      "prompt" | "prompts" => Some(Self::Prompt),
      "license" | "licenses" => Some(Self::License),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Capability => "capability",
      Self::Flow => "flow",
      Self::Playbook => "playbook",
      Self::Schema => "schema",
      Self::Prompt => "prompt",
      Self::License => "license",
    }
  }

  /// Directory under the cache root.
  pub fn dir_name(&self) -> &'static str {
    match self {
      Self::Capability => "capabilities",
      Self::Flow => "flows",
      Self::Playbook => "playbooks",
      Self::Schema => "schemas",
      Self::Prompt => "prompts",
      Self::License => "license",
    }
  }

  pub fn extension(&self) -> &'static str {
    match self {
      Self::Flow => "yaml",
      Self::Playbook | Self::Prompt => "md",
      Self::Capability | Self::Schema | Self::License => "json",
    }
  }

  pub fn content_type(&self) -> &'static str {
    match self {
      Self::Flow => "application/yaml",
      Self::Playbook | Self::Prompt => "text/markdown",
      Self::Capability | Self::Schema | Self::License => "application/json",
    }
  }

  /// Time-to-live applied when an asset of this kind is stored.
  pub fn ttl(&self) -> Duration {
    match self {
      Self::Schema => Duration::days(30),
      Self::Prompt | Self::License => Duration::days(1),
      Self::Capability | Self::Flow | Self::Playbook => Duration::days(7),
    }
  }
}

impl fmt::Display for AssetKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A parsed asset URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetUri {
  pub scheme: String,
  pub kind: AssetKind,
  pub namespace: String,
  pub id: String,
  pub version: String,
}

impl AssetUri {
  pub fn parse(raw: &str) -> Result<Self, UriError> {
    let raw = raw.trim();
    if raw.is_empty() {
      return Err(UriError::Empty);
    }

    let (scheme, rest) = match raw.split_once("://") {
      Some((scheme, rest)) => (scheme.to_string(), rest),
      None => (DEFAULT_SCHEME.to_string(), raw),
    };

    let (path, version) = match rest.rsplit_once('@') {
      Some((_, v)) if v.is_empty() => return Err(UriError::EmptyVersion(raw.to_string())),
      Some((path, v)) => (path, v.to_string()),
      None => (rest, LATEST.to_string()),
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 3 {
      return Err(UriError::MissingSegments(raw.to_string()));
    }
    if segments
      .iter()
      .chain(std::iter::once(&version.as_str()))
      .any(|s| *s == "." || *s == ".." || s.contains('\\'))
    {
      return Err(UriError::InvalidSegment(raw.to_string()));
    }

    let kind = AssetKind::from_segment(segments[0]).ok_or_else(|| UriError::UnknownKind {
      uri: raw.to_string(),
      kind: segments[0].to_string(),
    })?;

    Ok(Self {
      scheme,
      kind,
      namespace: segments[1].to_string(),
      id: segments[2..].join("/"),
      version,
    })
  }

  pub fn new(kind: AssetKind, namespace: &str, id: &str, version: Option<&str>) -> Self {
    Self {
      scheme: DEFAULT_SCHEME.to_string(),
      kind,
      namespace: namespace.to_string(),
      id: id.to_string(),
      version: version.unwrap_or(LATEST).to_string(),
    }
  }

  /// Scheme-independent identity, `kind/namespace/id@version`.
  pub fn key(&self) -> String {
    format!("{}/{}/{}@{}", self.kind, self.namespace, self.id, self.version)
  }

  /// Whether `other` names the same asset, ignoring version.
  pub fn same_asset(&self, other: &AssetUri) -> bool {
    self.kind == other.kind && self.namespace == other.namespace && self.id == other.id
  }

  /// Same asset at a different version.
  pub fn with_version(&self, version: &str) -> Self {
    Self {
      version: version.to_string(),
      ..self.clone()
    }
  }
}

impl fmt::Display for AssetUri {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}://{}/{}/{}@{}",
      self.scheme, self.kind, self.namespace, self.id, self.version
    )
  }
}

impl FromStr for AssetUri {
  type Err = UriError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}
