use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::api_types::{
  FetchAssetsRequest, FetchAssetsResponse, InstanceSyncRequest, InstanceSyncResponse,
  VersionCheckRequest, VersionCheckResponse,
};
use super::SyncApi;
use crate::config::RemoteConfig;
use crate::error::SyncError;

pub const VERSIONS_CHECK_PATH: &str = "/api/v1/sync/versions/check";
pub const ASSETS_FETCH_PATH: &str = "/api/v1/sync/assets/fetch";
pub const INSTANCES_SYNC_PATH: &str = "/api/v1/sync/instances/sync";

/// HTTP client for the remote sync API.
///
/// Requests are retried up to `max_retries` attempts on transport failures
/// (timeouts, connection errors). HTTP error statuses are mapped onto
/// [`SyncError`] and never retried.
#[derive(Clone)]
pub struct SyncClient {
  http: reqwest::Client,
  base_url: Option<String>,
  api_key: Option<String>,
  timeout: Duration,
  max_retries: usize,
  retry_backoff: Duration,
}

impl SyncClient {
  /// Build a client. A missing base URL or API key is accepted here; every
  /// request then fails with [`SyncError::NotConfigured`].
  pub fn new(config: &RemoteConfig, api_key: Option<String>) -> Result<Self> {
    let base_url = match config.base_url.as_deref().map(str::trim) {
      Some(url) if !url.is_empty() => {
        let parsed =
          url::Url::parse(url).map_err(|e| eyre!("Invalid sync base URL '{}': {}", url, e))?;
        Some(parsed.as_str().trim_end_matches('/').to_string())
      }
      _ => None,
    };

    let http = reqwest::Client::builder()
      .user_agent(format!("assetsync/{}", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      api_key: api_key.filter(|k| !k.trim().is_empty()),
      timeout: Duration::from_secs(config.timeout_secs.max(1)),
      max_retries: config.max_retries.max(1),
      retry_backoff: Duration::from_millis(config.retry_backoff_ms),
    })
  }

  pub fn is_configured(&self) -> bool {
    self.base_url.is_some() && self.api_key.is_some()
  }

  pub fn base_url(&self) -> Option<&str> {
    self.base_url.as_deref()
  }

  fn credentials(&self) -> Result<(&str, &str), SyncError> {
    let base = self
      .base_url
      .as_deref()
      .ok_or_else(|| SyncError::NotConfigured("base URL is not set".into()))?;
    let key = self
      .api_key
      .as_deref()
      .ok_or_else(|| SyncError::NotConfigured("API key is not set".into()))?;
    Ok((base, key))
  }

  /// Authenticated GET against `path` with its own timeout. Sent once by the
  /// caller, never retried.
  pub fn get_request(&self, path: &str, timeout: Duration) -> Result<reqwest::RequestBuilder, SyncError> {
    let (base, key) = self.credentials()?;
    Ok(
      self
        .http
        .get(format!("{}{}", base, path))
        .bearer_auth(key)
        .timeout(timeout),
    )
  }

  async fn post_json<Req, Res>(&self, path: &str, payload: &Req) -> Result<Res, SyncError>
  where
    Req: Serialize + ?Sized + Sync,
    Res: DeserializeOwned,
  {
    let (base, key) = self.credentials()?;
    let url = format!("{}{}", base, path);

    let mut attempt = 0;
    loop {
      attempt += 1;
      let result = self
        .http
        .post(url.as_str())
        .bearer_auth(key)
        .timeout(self.timeout)
        .json(payload)
        .send()
        .await;

      let error = match result {
        Ok(response) => {
          let status = response.status();
          match response.text().await {
            Ok(body) => return decode_response(status, &body),
            Err(e) => e,
          }
        }
        Err(e) => e,
      };

      let transient = error.is_timeout() || error.is_connect() || error.is_request();
      if !transient || attempt >= self.max_retries {
        return Err(SyncError::network(format!(
          "{} failed after {} attempt(s): {}",
          path, attempt, error
        )));
      }

      warn!(path, attempt, error = %error, "sync request failed, retrying");
      tokio::time::sleep(self.retry_backoff * attempt as u32).await;
    }
  }
}

#[async_trait]
impl SyncApi for SyncClient {
  async fn check_versions(
    &self,
    request: &VersionCheckRequest,
  ) -> Result<VersionCheckResponse, SyncError> {
    debug!(assets = request.assets.len(), "checking asset versions");
    self.post_json(VERSIONS_CHECK_PATH, request).await
  }

  async fn fetch_assets(
    &self,
    request: &FetchAssetsRequest,
  ) -> Result<FetchAssetsResponse, SyncError> {
    debug!(
      assets = request.assets.len(),
      incremental = request.incremental.is_some(),
      "fetching assets"
    );
    self.post_json(ASSETS_FETCH_PATH, request).await
  }

  async fn sync_instances(
    &self,
    request: &InstanceSyncRequest,
  ) -> Result<InstanceSyncResponse, SyncError> {
    debug!(
      direction = %request.direction,
      instances = request.instances.len(),
      "syncing instances"
    );
    self.post_json(INSTANCES_SYNC_PATH, request).await
  }
}

fn decode_response<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T, SyncError> {
  if !status.is_success() {
    return Err(map_status(status, body));
  }
  serde_json::from_str(body).map_err(|e| SyncError::InvalidResponse(e.to_string()))
}

/// Map a non-2xx response onto the error taxonomy.
pub fn map_status(status: StatusCode, body: &str) -> SyncError {
  let message = error_message(body);
  match status {
    StatusCode::UNAUTHORIZED => SyncError::Authentication(message),
    StatusCode::FORBIDDEN => {
      if body.to_ascii_lowercase().contains("license") {
        SyncError::LicenseExpired(message)
      } else {
        SyncError::Authentication(message)
      }
    }
    StatusCode::CONFLICT => match error_code(body) {
      Some(code) if code.to_ascii_lowercase().starts_with("version") => {
        SyncError::Version { code, message }
      }
      _ => SyncError::Network {
        message: format!("HTTP {}: {}", status, body),
        status: Some(status.as_u16()),
      },
    },
    StatusCode::TOO_MANY_REQUESTS => SyncError::Quota(message),
    _ => SyncError::Network {
      message: format!("HTTP {}: {}", status, body),
      status: Some(status.as_u16()),
    },
  }
}

/// Locations an error body may carry a machine-readable code in:
/// `{"error_code"}`, `{"code"}`, `{"error": {"code"}}`, `{"detail": {"error_code"}}`.
fn error_code(body: &str) -> Option<String> {
  let value: serde_json::Value = serde_json::from_str(body).ok()?;
  let candidates = [
    value.get("error_code"),
    value.get("code"),
    value.get("error").and_then(|e| e.get("code")),
    value.get("detail").and_then(|d| d.get("error_code")),
    value.get("detail").and_then(|d| d.get("code")),
  ];
  let code = candidates
    .into_iter()
    .flatten()
    .find_map(|v| v.as_str().map(String::from));
  code
}

fn error_message(body: &str) -> String {
  let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
  let message = parsed.as_ref().and_then(|value| {
    [
      value.get("message"),
      value.get("detail").and_then(|d| d.get("message")),
      value.get("detail"),
      value.get("error").and_then(|e| e.get("message")),
      value.get("error"),
    ]
    .into_iter()
    .flatten()
    .find_map(|v| v.as_str().map(String::from))
  });
  message.unwrap_or_else(|| {
    let trimmed = body.trim();
    if trimmed.is_empty() {
      "<empty>".to_string()
    } else {
      trimmed.to_string()
    }
  })
}
