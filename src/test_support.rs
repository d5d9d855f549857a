//! Scripted remote API used by unit tests.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::cache::storage::sha256_checksum;
use crate::error::SyncError;
use crate::remote::api_types::{
  FetchAssetsRequest, FetchAssetsResponse, InstanceSyncRequest, InstanceSyncResponse,
  RemoteAsset, VersionCheckRequest, VersionCheckResponse,
};
use crate::remote::SyncApi;

/// Replays queued responses in order; an empty queue answers with a
/// network error.
#[derive(Default)]
pub struct ScriptedApi {
  pub fetch_responses: Mutex<VecDeque<Result<FetchAssetsResponse, SyncError>>>,
  pub sync_responses: Mutex<VecDeque<Result<InstanceSyncResponse, SyncError>>>,
  pub version_responses: Mutex<VecDeque<Result<VersionCheckResponse, SyncError>>>,
  pub fetch_requests: Mutex<Vec<FetchAssetsRequest>>,
  pub sync_requests: Mutex<Vec<InstanceSyncRequest>>,
}

impl ScriptedApi {
  pub fn push_fetch(&self, response: Result<FetchAssetsResponse, SyncError>) {
    self.fetch_responses.lock().unwrap().push_back(response);
  }

  pub fn push_sync(&self, response: Result<InstanceSyncResponse, SyncError>) {
    self.sync_responses.lock().unwrap().push_back(response);
  }

  pub fn push_version(&self, response: Result<VersionCheckResponse, SyncError>) {
    self.version_responses.lock().unwrap().push_back(response);
  }

  pub fn fetch_count(&self) -> usize {
    self.fetch_requests.lock().unwrap().len()
  }

  pub fn sync_count(&self) -> usize {
    self.sync_requests.lock().unwrap().len()
  }
}

#[async_trait]
impl SyncApi for ScriptedApi {
  async fn check_versions(
    &self,
    _request: &VersionCheckRequest,
  ) -> Result<VersionCheckResponse, SyncError> {
    self
      .version_responses
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| Err(SyncError::network("no scripted response")))
  }

  async fn fetch_assets(
    &self,
    request: &FetchAssetsRequest,
  ) -> Result<FetchAssetsResponse, SyncError> {
    self.fetch_requests.lock().unwrap().push(request.clone());
    self
      .fetch_responses
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| Err(SyncError::network("no scripted response")))
  }

  async fn sync_instances(
    &self,
    request: &InstanceSyncRequest,
  ) -> Result<InstanceSyncResponse, SyncError> {
    self.sync_requests.lock().unwrap().push(request.clone());
    self
      .sync_responses
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| Err(SyncError::network("no scripted response")))
  }
}

/// A remote asset carrying `bytes` with a correct checksum.
pub fn remote_asset(uri: &str, bytes: &[u8]) -> RemoteAsset {
  RemoteAsset {
    uri: uri.to_string(),
    content_type: None,
    content: BASE64.encode(bytes),
    checksum: Some(sha256_checksum(bytes)),
    metadata: Default::default(),
  }
}

pub fn assets_response(assets: Vec<RemoteAsset>) -> FetchAssetsResponse {
  FetchAssetsResponse {
    assets,
    diffs: Vec::new(),
  }
}
