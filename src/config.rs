use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  /// Asset cache root (defaults to $XDG_DATA_HOME/assetsync/cache)
  pub cache_dir: Option<PathBuf>,
  /// Instance store root (defaults to $XDG_DATA_HOME/assetsync/instances)
  pub instances_dir: Option<PathBuf>,
  /// Overrides the device id generated on first cache open
  pub device_id: Option<String>,
  pub license_id: Option<String>,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub refresh: RefreshConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  pub base_url: Option<String>,
  pub client_version: String,
  /// Capabilities announced during the version check
  pub capabilities: Vec<String>,
  pub timeout_secs: u64,
  /// Total attempts per request, including the first
  pub max_retries: usize,
  pub retry_backoff_ms: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      client_version: env!("CARGO_PKG_VERSION").to_string(),
      capabilities: Vec::new(),
      timeout_secs: 30,
      max_retries: 3,
      retry_backoff_ms: 250,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub check_interval_secs: u64,
  pub timeout_secs: u64,
  /// Consecutive failed probes before the status flips
  pub failure_threshold: u32,
  pub health_path: String,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      check_interval_secs: 300,
      timeout_secs: 5,
      failure_threshold: 3,
      health_path: "/api/v1/health".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
  /// Background refresh worker tasks
  pub workers: usize,
  pub queue_capacity: usize,
}

impl Default for RefreshConfig {
  fn default() -> Self {
    Self {
      workers: 2,
      queue_capacity: 64,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive; RUST_LOG takes precedence
  pub level: String,
  /// Directory for daily-rolling log files. Stderr only when unset.
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./assetsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/assetsync/config.yaml
  ///
  /// Without any file the defaults are used, which is enough for offline use.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("assetsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("assetsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the API key from environment variables.
  ///
  /// Checks ASSETSYNC_API_KEY first, then ASSETSYNC_TOKEN as fallback.
  /// Absence is not an error: the sync client reports itself unconfigured.
  pub fn get_api_key() -> Option<String> {
    std::env::var("ASSETSYNC_API_KEY")
      .or_else(|_| std::env::var("ASSETSYNC_TOKEN"))
      .ok()
      .filter(|k| !k.trim().is_empty())
  }

  pub fn cache_root(&self) -> Result<PathBuf> {
    match &self.cache_dir {
      Some(dir) => Ok(dir.clone()),
      None => Ok(Self::data_dir()?.join("cache")),
    }
  }

  pub fn instances_root(&self) -> Result<PathBuf> {
    match &self.instances_dir {
      Some(dir) => Ok(dir.clone()),
      None => Ok(Self::data_dir()?.join("instances")),
    }
  }

  fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("assetsync"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_yaml_uses_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.remote.max_retries, 3);
    assert_eq!(config.remote.timeout_secs, 30);
    assert_eq!(config.connectivity.check_interval_secs, 300);
    assert_eq!(config.connectivity.timeout_secs, 5);
    assert_eq!(config.connectivity.failure_threshold, 3);
    assert_eq!(config.refresh.workers, 2);
    assert_eq!(config.logging.level, "info");
  }

  #[test]
  fn test_partial_sections_keep_other_defaults() {
    let config = Config::from_yaml(
      r#"
remote:
  base_url: https://sync.example.com
  max_retries: 5
cache_dir: /tmp/assetsync-cache
connectivity:
  health_path: /healthz
"#,
    )
    .unwrap();
    assert_eq!(
      config.remote.base_url.as_deref(),
      Some("https://sync.example.com")
    );
    assert_eq!(config.remote.max_retries, 5);
    assert_eq!(config.remote.timeout_secs, 30);
    assert_eq!(config.connectivity.health_path, "/healthz");
    assert_eq!(config.connectivity.failure_threshold, 3);
    assert_eq!(
      config.cache_root().unwrap(),
      PathBuf::from("/tmp/assetsync-cache")
    );
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/assetsync.yaml"))).is_err());
  }
}
