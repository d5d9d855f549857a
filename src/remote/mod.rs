//! Remote sync API: wire types, the [`SyncApi`] seam and its HTTP client.

pub mod api_types;
pub mod client;

use async_trait::async_trait;

use crate::error::SyncError;
use api_types::{
  FetchAssetsRequest, FetchAssetsResponse, InstanceSyncRequest, InstanceSyncResponse,
  VersionCheckRequest, VersionCheckResponse,
};

pub use client::SyncClient;

/// Operations offered by the remote authority.
#[async_trait]
pub trait SyncApi: Send + Sync {
  async fn check_versions(
    &self,
    request: &VersionCheckRequest,
  ) -> Result<VersionCheckResponse, SyncError>;

  async fn fetch_assets(
    &self,
    request: &FetchAssetsRequest,
  ) -> Result<FetchAssetsResponse, SyncError>;

  async fn sync_instances(
    &self,
    request: &InstanceSyncRequest,
  ) -> Result<InstanceSyncResponse, SyncError>;
}
